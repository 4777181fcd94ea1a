use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Closed label vocabulary the model is constrained to. Anything outside it
/// in a response is dropped rather than persisted.
pub const LABEL_VOCABULARY: &[&str] = &[
    "TO_RESPOND",
    "FYI",
    "COMMENT",
    "NOTIFICATION",
    "MEETING_UPDATE",
    "AWAITING_REPLY",
    "ACTIONED",
    "MARKETING",
];

const MAX_CLASSIFY_ATTEMPTS: usize = 5;
const BODY_EXCERPT_MAX_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = r#"You are an email triage assistant. Classify the email into zero or more of these labels and no others: TO_RESPOND, FYI, COMMENT, NOTIFICATION, MEETING_UPDATE, AWAITING_REPLY, ACTIONED, MARKETING.

Respond with a single JSON object of the form {"labels": ["LABEL", ...]} and nothing else."#;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier produced no parsable label envelope after {attempts} attempts")]
    MalformedOutput { attempts: usize },

    #[error("classifier model call failed after {attempts} attempts: {source}")]
    Model {
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// The external generative model, abstracted to one text-in/text-out call.
/// The engine owns retry and parsing; the model owns nothing but generation.
#[async_trait(?Send)]
pub trait TextModel {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// OpenAI-style chat-completions backend for `TextModel`.
pub struct HttpTextModel {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpTextModel {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait(?Send)]
impl TextModel for HttpTextModel {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("classifier model request: {}", self.endpoint))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("read classifier model response body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "classifier model request failed: status={status} body={}",
                body.chars().take(200).collect::<String>()
            ));
        }

        let decoded: ChatCompletionResponse =
            serde_json::from_str(&body).context("decode chat completion response")?;
        decoded
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat completion response contained no content"))
    }
}

pub struct LabelClassifier<M> {
    model: M,
}

impl<M: TextModel> LabelClassifier<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    /// Classify one message into labels from the closed vocabulary. Malformed
    /// model output and transport failures both consume attempts; the error
    /// variant distinguishes which exhausted the budget. Callers should not
    /// let a classification failure block persistence of the message itself.
    pub async fn classify(
        &self,
        subject: &str,
        body_text: &str,
    ) -> Result<Vec<String>, ClassifyError> {
        let excerpt: String = body_text.chars().take(BODY_EXCERPT_MAX_CHARS).collect();
        let user_prompt = format!("Subject: {subject}\n\nBody:\n{excerpt}");

        let mut last_model_error: Option<anyhow::Error> = None;

        for attempt in 1..=MAX_CLASSIFY_ATTEMPTS {
            let raw = match self.model.generate(SYSTEM_PROMPT, &user_prompt).await {
                Ok(raw) => raw,
                Err(error) => {
                    warn!(attempt, "classifier model call failed: {error:#}");
                    last_model_error = Some(error);
                    continue;
                }
            };

            match parse_label_envelope(&raw) {
                Some(labels) => return Ok(labels),
                None => {
                    warn!(attempt, "classifier returned unparsable output");
                    last_model_error = None;
                }
            }
        }

        match last_model_error {
            Some(source) => Err(ClassifyError::Model {
                attempts: MAX_CLASSIFY_ATTEMPTS,
                source,
            }),
            None => Err(ClassifyError::MalformedOutput {
                attempts: MAX_CLASSIFY_ATTEMPTS,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LabelEnvelope {
    labels: Vec<String>,
}

/// Extract and validate a `{"labels": [...]}` envelope from model output,
/// tolerating markdown fences and surrounding prose. Labels outside the
/// vocabulary are filtered, not treated as errors.
fn parse_label_envelope(raw: &str) -> Option<Vec<String>> {
    let candidate = extract_json_object(raw)?;
    let envelope: LabelEnvelope = serde_json::from_str(&candidate).ok()?;

    let mut labels: Vec<String> = envelope
        .labels
        .into_iter()
        .map(|label| label.trim().to_ascii_uppercase())
        .filter(|label| LABEL_VOCABULARY.contains(&label.as_str()))
        .collect();
    labels.dedup();
    Some(labels)
}

/// Pull the first JSON object out of `raw`, whether it sits bare or inside a
/// fenced code block.
fn extract_json_object(raw: &str) -> Option<String> {
    let inner = Regex::new(r"(?s)```(?:json)?\s*(.*?)```")
        .ok()
        .and_then(|fence| {
            fence
                .captures(raw)
                .and_then(|captures| captures.get(1))
                .map(|m| m.as_str().to_string())
        });
    let inner = inner.as_deref().unwrap_or(raw);

    let start = inner.find('{')?;
    let region = &inner[start..];
    let end = find_json_object_end(region)?;
    Some(region[..end].to_string())
}

/// Find the end of a JSON object by brace-matching. Returns index past
/// closing '}'.
fn find_json_object_end(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use super::{
        extract_json_object, parse_label_envelope, ClassifyError, LabelClassifier, TextModel,
    };

    struct ScriptedModel {
        responses: RefCell<VecDeque<Result<String>>>,
        calls: RefCell<usize>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: RefCell::new(responses.into()),
                calls: RefCell::new(0),
            }
        }
    }

    #[async_trait(?Send)]
    impl TextModel for ScriptedModel {
        async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
            *self.calls.borrow_mut() += 1;
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("script exhausted")))
        }
    }

    #[tokio::test]
    async fn well_formed_output_classifies_on_first_attempt() {
        let model = ScriptedModel::new(vec![Ok(r#"{"labels": ["FYI", "MARKETING"]}"#.to_string())]);
        let classifier = LabelClassifier::new(model);

        let labels = classifier
            .classify("Weekly digest", "Here is your newsletter")
            .await
            .expect("classify");
        assert_eq!(labels, vec!["FYI".to_string(), "MARKETING".to_string()]);
        assert_eq!(*classifier.model.calls.borrow(), 1);
    }

    #[tokio::test]
    async fn fenced_output_with_prose_is_accepted() {
        let raw = "Sure! Here is the classification:\n```json\n{\"labels\": [\"to_respond\"]}\n```\nLet me know if you need more.";
        let model = ScriptedModel::new(vec![Ok(raw.to_string())]);
        let classifier = LabelClassifier::new(model);

        let labels = classifier
            .classify("Question", "Can you review this?")
            .await
            .expect("classify");
        assert_eq!(labels, vec!["TO_RESPOND".to_string()]);
    }

    #[tokio::test]
    async fn retries_until_parsable_then_succeeds() {
        let model = ScriptedModel::new(vec![
            Ok("I think this is spam".to_string()),
            Ok("labels: MARKETING".to_string()),
            Ok(r#"{"labels": ["MARKETING"]}"#.to_string()),
        ]);
        let classifier = LabelClassifier::new(model);

        let labels = classifier
            .classify("Big sale", "Buy now")
            .await
            .expect("classify");
        assert_eq!(labels, vec!["MARKETING".to_string()]);
        assert_eq!(*classifier.model.calls.borrow(), 3);
    }

    #[tokio::test]
    async fn exhausting_the_budget_on_garbage_is_malformed_output() {
        let garbage: Vec<Result<String>> =
            (0..5).map(|i| Ok(format!("nonsense {i}"))).collect();
        let classifier = LabelClassifier::new(ScriptedModel::new(garbage));

        let error = classifier
            .classify("Subject", "Body")
            .await
            .expect_err("budget exhausted");
        assert!(matches!(
            error,
            ClassifyError::MalformedOutput { attempts: 5 }
        ));
        assert_eq!(*classifier.model.calls.borrow(), 5);
    }

    #[tokio::test]
    async fn transport_failure_on_final_attempt_is_surfaced_distinctly() {
        let mut responses: Vec<Result<String>> = (0..4).map(|i| Ok(format!("noise {i}"))).collect();
        responses.push(Err(anyhow!("connection reset")));
        let classifier = LabelClassifier::new(ScriptedModel::new(responses));

        let error = classifier
            .classify("Subject", "Body")
            .await
            .expect_err("budget exhausted");
        assert!(matches!(error, ClassifyError::Model { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn unknown_labels_are_filtered_not_fatal() {
        let model = ScriptedModel::new(vec![Ok(
            r#"{"labels": ["FYI", "TOTALLY_MADE_UP", "actioned"]}"#.to_string(),
        )]);
        let classifier = LabelClassifier::new(model);

        let labels = classifier.classify("s", "b").await.expect("classify");
        assert_eq!(labels, vec!["FYI".to_string(), "ACTIONED".to_string()]);
    }

    #[test]
    fn json_extraction_handles_nested_and_trailing_text() {
        let raw = r#"prefix {"labels": ["FYI"], "meta": {"x": "}"}} suffix"#;
        let extracted = extract_json_object(raw).expect("extract");
        assert_eq!(extracted, r#"{"labels": ["FYI"], "meta": {"x": "}"}}"#);
    }

    #[test]
    fn envelope_without_labels_field_is_rejected() {
        assert!(parse_label_envelope(r#"{"tags": ["FYI"]}"#).is_none());
        assert!(parse_label_envelope("no json here at all").is_none());
    }
}
