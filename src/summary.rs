//! # Chat Summary Helper
//!
//! Produces a short natural-language summary of a finished conversation.
//! The call is best effort: every failure turns into a fixed placeholder
//! string and never reaches the caller as an error.
//!
//! ## Outcomes:
//! - Empty transcript → [`NO_HISTORY`], without any external call
//! - Backend failure, timeout, malformed or empty response → [`SUMMARY_FAILED`]
//! - Otherwise → the text extracted from `content[0].text`

use crate::config::SummaryConfig;
use crate::deadline::{self, Deadline};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const NO_HISTORY: &str = "No conversation history available.";
pub const SUMMARY_FAILED: &str = "Failed to generate summary.";

/// One `{role, message}` entry of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub message: String,
}

/// A single request/response call to a text model.
#[async_trait]
pub trait SummaryBackend: Send + Sync {
    async fn invoke(&self, body: &Value) -> Result<Value>;
}

/// Posts the request body as JSON to a configured endpoint.
///
/// With an empty endpoint every call fails, which the summarizer turns into
/// the failure placeholder.
pub struct HttpSummaryBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpSummaryBackend {
    pub fn new(config: &SummaryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build summary HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SummaryBackend for HttpSummaryBackend {
    async fn invoke(&self, body: &Value) -> Result<Value> {
        if self.endpoint.is_empty() {
            anyhow::bail!("summary endpoint is not configured");
        }

        let mut request = self.client.post(&self.endpoint).json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .context("summary request failed")?
            .error_for_status()
            .context("summary backend returned an error status")?;

        response
            .json::<Value>()
            .await
            .context("summary response is not JSON")
    }
}

pub struct Summarizer {
    backend: Arc<dyn SummaryBackend>,
    model_id: String,
    max_tokens: u32,
    anthropic_version: String,
    timeout: Duration,
}

impl Summarizer {
    pub fn new(backend: Arc<dyn SummaryBackend>, config: &SummaryConfig) -> Self {
        Self {
            backend,
            model_id: config.model_id.clone(),
            max_tokens: config.max_tokens,
            anthropic_version: config.anthropic_version.clone(),
            timeout: config.timeout(),
        }
    }

    /// Summarize `turns`, falling back to a placeholder on any failure.
    pub async fn summarize(&self, turns: &[ChatTurn]) -> String {
        if turns.is_empty() {
            return NO_HISTORY.to_string();
        }

        let body = self.request_body(turns);
        let response = match deadline::race(self.timeout, self.backend.invoke(&body)).await {
            Deadline::Completed(Ok(value)) => value,
            Deadline::Completed(Err(err)) => {
                warn!(error = %err, "Error generating chat summary");
                return SUMMARY_FAILED.to_string();
            }
            Deadline::Expired => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Chat summary timed out");
                return SUMMARY_FAILED.to_string();
            }
        };

        match extract_text(&response) {
            Some(text) => {
                info!(turns = turns.len(), chars = text.len(), "Chat summary generated");
                text
            }
            None => {
                warn!("Chat summary response had no text content");
                SUMMARY_FAILED.to_string()
            }
        }
    }

    fn request_body(&self, turns: &[ChatTurn]) -> Value {
        json!({
            "model": self.model_id,
            "messages": [{
                "role": "user",
                "content": format!(
                    "Summarize the following chat between a customer and an agent:\n{}",
                    render_transcript(turns)
                ),
            }],
            "max_tokens": self.max_tokens,
            "anthropic_version": self.anthropic_version,
        })
    }
}

/// `"1. role: message"` lines, one per turn.
fn render_transcript(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .enumerate()
        .map(|(index, turn)| format!("{}. {}: {}", index + 1, turn.role, turn.message))
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_text(response: &Value) -> Option<String> {
    response
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Reply {
        Json(Value),
        Fail,
        Hang,
    }

    struct StubBackend {
        reply: Reply,
        calls: AtomicUsize,
        last_body: Mutex<Option<Value>>,
    }

    impl StubBackend {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                last_body: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl SummaryBackend for StubBackend {
        async fn invoke(&self, body: &Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_body.lock().unwrap() = Some(body.clone());
            match &self.reply {
                Reply::Json(value) => Ok(value.clone()),
                Reply::Fail => anyhow::bail!("throttled"),
                Reply::Hang => std::future::pending::<Result<Value>>().await,
            }
        }
    }

    fn summarizer(backend: Arc<StubBackend>) -> Summarizer {
        Summarizer::new(backend, &AppConfig::default().summary)
    }

    fn turns() -> Vec<ChatTurn> {
        vec![
            ChatTurn { role: "USER".into(), message: "I need to cancel".into() },
            ChatTurn { role: "ASSISTANT".into(), message: "Which reservation?".into() },
        ]
    }

    #[tokio::test]
    async fn test_empty_history_skips_backend() {
        let backend = StubBackend::new(Reply::Fail);
        let result = summarizer(backend.clone()).summarize(&[]).await;
        assert_eq!(result, NO_HISTORY);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_yields_placeholder() {
        let backend = StubBackend::new(Reply::Fail);
        let result = summarizer(backend.clone()).summarize(&turns()).await;
        assert_eq!(result, SUMMARY_FAILED);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_text_yields_placeholder() {
        let backend = StubBackend::new(Reply::Json(json!({"content": []})));
        assert_eq!(summarizer(backend).summarize(&turns()).await, SUMMARY_FAILED);

        let backend = StubBackend::new(Reply::Json(json!({"content": [{"text": "  "}]})));
        assert_eq!(summarizer(backend).summarize(&turns()).await, SUMMARY_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_times_out() {
        let backend = StubBackend::new(Reply::Hang);
        assert_eq!(summarizer(backend).summarize(&turns()).await, SUMMARY_FAILED);
    }

    #[tokio::test]
    async fn test_success_extracts_text_and_renders_transcript() {
        let backend = StubBackend::new(Reply::Json(json!({
            "content": [{"type": "text", "text": "Customer asked to cancel."}]
        })));
        let result = summarizer(backend.clone()).summarize(&turns()).await;
        assert_eq!(result, "Customer asked to cancel.");

        let body = backend.last_body.lock().unwrap().clone().unwrap();
        let prompt = body["messages"][0]["content"].as_str().unwrap();
        assert!(prompt.ends_with("1. USER: I need to cancel\n2. ASSISTANT: Which reservation?"));
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
    }

    #[tokio::test]
    async fn test_unconfigured_http_backend_fails_softly() {
        let config = AppConfig::default().summary;
        let backend = Arc::new(HttpSummaryBackend::new(&config).unwrap());
        let result = Summarizer::new(backend, &config).summarize(&turns()).await;
        assert_eq!(result, SUMMARY_FAILED);
    }
}
