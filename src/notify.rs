use serde::Serialize;

/// Progress of an in-flight sync pass, emitted once per processed thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub processed: usize,
    pub total: usize,
    pub current_email: String,
}

/// Receives sync events so a UI can render threads progressively instead of
/// waiting for the pass to finish. `on_thread_saved` fires only after the
/// thread and its messages are committed to the cache, so an observer never
/// sees a dangling reference.
pub trait SyncObserver {
    fn on_progress(&self, _progress: &SyncProgress) {}

    fn on_thread_saved(&self, _thread_external_id: &str) {}
}

/// Observer that discards every event.
pub struct NullObserver;

impl SyncObserver for NullObserver {}
