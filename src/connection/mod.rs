//! # Client Connections
//!
//! One client connection owns one session resource. This module defines
//! what crosses the client boundary; [`handler`] holds the per-connection
//! state machine and [`socket`] the WebSocket actor that feeds it.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Client connects to `/ws/session`; a session is created and initiated
//! 2. **Prompt setup**: `promptStart`, then `systemPrompt`
//! 3. **Audio Streaming**: `audioStart`, then `audioInput` chunks (binary frames or base64)
//! 4. **Relay**: Backend events are forwarded as they are emitted
//! 5. **Termination**: `stopAudio` produces a `chatSummary` and closes the session
//!
//! ## Message Format:
//! Every text frame is `{"event": <name>, "data": <payload>}`.

pub mod handler;
pub mod socket;

use crate::audio::AudioPayload;
use crate::session::OutboundEvent;
use crate::summary::ChatTurn;
use serde::{Deserialize, Serialize};

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    PromptStart,
    SystemPrompt(String),
    AudioStart,
    AudioInput(AudioPayload),
    StopAudio(StopAudioRequest),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::PromptStart => "promptStart",
            ClientEvent::SystemPrompt(_) => "systemPrompt",
            ClientEvent::AudioStart => "audioStart",
            ClientEvent::AudioInput(_) => "audioInput",
            ClientEvent::StopAudio(_) => "stopAudio",
        }
    }
}

/// Payload of `stopAudio`: the client's view of the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopAudioRequest {
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

/// Everything that can arrive in a connection's inbox, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A client event to process
    Client(ClientEvent),
    /// The session's event stream ended (closed or force-closed)
    SessionEnded,
    /// The transport went away
    Disconnect,
}

/// Where a connection's outbound events go.
///
/// Both calls are fire-and-forget: a connection that has already gone away
/// silently drops them.
pub trait ClientSink: Clone + Send + 'static {
    fn send(&self, event: OutboundEvent);

    fn close(&self);
}
