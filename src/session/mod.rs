//! # Session Resources
//!
//! A session resource is the stateful handle to one duplex conversation with
//! the speech backend. The bridge never implements the conversation itself;
//! it drives the handle through its lifecycle and relays what it emits.
//!
//! ## Session Lifecycle:
//! 1. **Uninitialized**: Handle created by the backend
//! 2. **Created**: `initiate` accepted, waiting for prompt setup
//! 3. **PromptStarted**: Prompt setup begun, system prompt may be configured
//! 4. **AudioActive**: Audio channel open, chunks may be streamed
//! 5. **Closing**: Audio content ended, prompt being ended
//! 6. **Closed**: Released, either gracefully or by force
//!
//! ## Two traits, two audiences:
//! - [`StreamSession`]: streaming and setup calls, used only by the connection
//!   that owns the session
//! - [`SessionControl`]: lifecycle calls, the only view the registry, reaper
//!   and shutdown coordinator ever hold

pub mod loopback;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique token for one client connection, valid for the connection's lifetime.
///
/// It is the join key between a WebSocket and its session resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh identity for a new connection.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Current state of a session resource, as reported by the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Created,
    PromptStarted,
    AudioActive,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Created => "created",
            SessionState::PromptStarted => "prompt_started",
            SessionState::AudioActive => "audio_active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Failures reported by a session resource.
///
/// The `Display` text is forwarded verbatim to the client in the `details`
/// field of an `error` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The call is not valid in the session's current state.
    OutOfOrder {
        operation: &'static str,
        state: SessionState,
    },
    /// The session has already been released.
    Closed,
    /// The backend rejected or failed the call.
    Backend(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::OutOfOrder { operation, state } => {
                write!(f, "{} is not allowed while the session is {}", operation, state.as_str())
            }
            SessionError::Closed => write!(f, "Session is closed"),
            SessionError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

/// Events sent to a client, in the `{"event": ..., "data": ...}` envelope.
///
/// Every variant except `ChatSummary` is produced by a session resource and
/// relayed unmodified; `ChatSummary` is synthesized once per `stopAudio`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    ContentStart(Value),
    TextOutput(Value),
    AudioOutput(Value),
    ToolUse(Value),
    ToolResult(Value),
    ContentEnd(Value),
    StreamComplete,
    Error(Value),
    ChatSummary {
        #[serde(rename = "chatSummary")]
        chat_summary: String,
    },
}

impl OutboundEvent {
    /// A handler-synthesized error event.
    pub fn error(message: &str, details: impl fmt::Display) -> Self {
        OutboundEvent::Error(json!({
            "message": message,
            "details": details.to_string(),
        }))
    }

    /// Event name as it appears on the wire, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::ContentStart(_) => "contentStart",
            OutboundEvent::TextOutput(_) => "textOutput",
            OutboundEvent::AudioOutput(_) => "audioOutput",
            OutboundEvent::ToolUse(_) => "toolUse",
            OutboundEvent::ToolResult(_) => "toolResult",
            OutboundEvent::ContentEnd(_) => "contentEnd",
            OutboundEvent::StreamComplete => "streamComplete",
            OutboundEvent::Error(_) => "error",
            OutboundEvent::ChatSummary { .. } => "chatSummary",
        }
    }
}

/// Lifecycle view of a session resource.
///
/// ## Contract:
/// - `close` is idempotent once the session is closed
/// - `force_close` is idempotent, never waits for in-flight calls, and must
///   succeed even after a partially completed graceful chain
/// - `last_activity` is monotonically non-decreasing
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// The connection this session was created for.
    fn id(&self) -> &ConnectionId;

    fn state(&self) -> SessionState;

    fn is_active(&self) -> bool;

    fn last_activity(&self) -> Instant;

    async fn end_audio_content(&self) -> Result<(), SessionError>;

    async fn end_prompt(&self) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;

    fn force_close(&self) -> Result<(), SessionError>;
}

/// Streaming view of a session resource, owned by exactly one connection.
#[async_trait]
pub trait StreamSession: Send + Sync {
    async fn initiate(&self) -> Result<(), SessionError>;

    async fn setup_prompt_start(&self) -> Result<(), SessionError>;

    async fn setup_system_prompt(&self, text: &str) -> Result<(), SessionError>;

    async fn setup_start_audio(&self) -> Result<(), SessionError>;

    async fn stream_audio(&self, pcm: &[u8]) -> Result<(), SessionError>;
}

/// Everything a backend hands back for a new session.
pub struct CreatedSession {
    pub stream: Arc<dyn StreamSession>,
    pub control: Arc<dyn SessionControl>,
    /// Ordered events emitted by the resource; ends when the resource is released.
    pub events: mpsc::Receiver<OutboundEvent>,
}

/// Factory for session resources.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn create(&self, id: &ConnectionId) -> Result<CreatedSession, SessionError>;
}

/// Drive a session through `end-audio-content → end-prompt → close`.
///
/// Each step is awaited before the next; the first failure stops the chain.
pub async fn graceful_chain(session: &dyn SessionControl) -> Result<(), SessionError> {
    session.end_audio_content().await?;
    session.end_prompt().await?;
    session.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedSession;

    #[test]
    fn test_outbound_envelope() {
        let event = OutboundEvent::TextOutput(json!({"role": "ASSISTANT", "content": "hi"}));
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["event"], "textOutput");
        assert_eq!(wire["data"]["content"], "hi");

        let wire = serde_json::to_value(OutboundEvent::StreamComplete).unwrap();
        assert_eq!(wire, json!({"event": "streamComplete"}));

        let wire = serde_json::to_value(OutboundEvent::ChatSummary {
            chat_summary: "short".to_string(),
        })
        .unwrap();
        assert_eq!(wire, json!({"event": "chatSummary", "data": {"chatSummary": "short"}}));
    }

    #[test]
    fn test_error_event_carries_details() {
        let event = OutboundEvent::error("Error processing audio", SessionError::Closed);
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["data"]["message"], "Error processing audio");
        assert_eq!(wire["data"]["details"], "Session is closed");
    }

    #[tokio::test]
    async fn test_graceful_chain_runs_in_order() {
        let session = ScriptedSession::new("chain");
        graceful_chain(session.as_ref()).await.unwrap();
        assert_eq!(session.calls(), vec!["endAudioContent", "endPrompt", "close"]);
    }

    #[tokio::test]
    async fn test_graceful_chain_stops_at_first_failure() {
        let session = ScriptedSession::new("chain");
        session.fail_on("endPrompt");
        let err = graceful_chain(session.as_ref()).await.unwrap_err();
        assert!(matches!(err, SessionError::Backend(_)));
        assert_eq!(session.calls(), vec!["endAudioContent", "endPrompt"]);
    }
}
