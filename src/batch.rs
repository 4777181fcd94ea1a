use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::time::sleep;

/// How a batched provider operation is throttled: at most `chunk_size`
/// in-flight calls, with a pause between chunks to stay under rate limits.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub chunk_size: usize,
    pub inter_chunk_delay: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            inter_chunk_delay: Duration::from_millis(200),
        }
    }
}

/// Run `op` over every item in bounded-concurrency chunks. All items in a
/// chunk settle independently; a failure never cancels its siblings. The
/// output preserves input order, one `Result` per item, so callers decide
/// how to treat partial failure.
pub async fn run_chunked<T, U, F, Fut>(items: Vec<T>, policy: BatchPolicy, op: F) -> Vec<Result<U>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<U>>,
{
    let chunk_size = policy.chunk_size.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut iter = items.into_iter().peekable();

    while iter.peek().is_some() {
        let chunk: Vec<T> = iter.by_ref().take(chunk_size).collect();
        let settled = join_all(chunk.into_iter().map(&op)).await;
        results.extend(settled);

        if iter.peek().is_some() && !policy.inter_chunk_delay.is_zero() {
            sleep(policy.inter_chunk_delay).await;
        }
    }

    results
}
