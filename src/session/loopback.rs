//! # Loopback Session Backend
//!
//! A self-contained backend that enforces the session state machine and
//! echoes streamed audio back to the client. It makes the bridge runnable
//! end to end without a speech service; a production backend replaces it
//! behind [`SessionBackend`].
//!
//! ## Emitted events:
//! - `contentStart` when the audio channel opens
//! - `audioOutput` for every streamed chunk (the same PCM, base64-encoded)
//! - `contentEnd` when audio content ends
//! - `streamComplete` on graceful close
//!
//! Force-close emits nothing; it drops the event sender so the relay ends.

use super::{
    ConnectionId, CreatedSession, OutboundEvent, SessionBackend, SessionControl, SessionError,
    SessionState, StreamSession,
};
use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Creates [`LoopbackSession`]s with a bounded event channel.
pub struct LoopbackBackend {
    event_buffer: usize,
}

impl LoopbackBackend {
    pub fn new(event_buffer: usize) -> Self {
        Self { event_buffer }
    }
}

#[async_trait]
impl SessionBackend for LoopbackBackend {
    async fn create(&self, id: &ConnectionId) -> Result<CreatedSession, SessionError> {
        let (tx, rx) = mpsc::channel(self.event_buffer.max(1));
        let session = Arc::new(LoopbackSession::new(id.clone(), tx));
        debug!(connection_id = %id, prompt_name = %session.prompt_name, "Loopback session created");

        Ok(CreatedSession {
            stream: session.clone(),
            control: session,
            events: rx,
        })
    }
}

struct LoopbackInner {
    state: SessionState,
    last_activity: Instant,
    events: Option<mpsc::Sender<OutboundEvent>>,
    system_prompt: Option<String>,
    audio_content_id: Option<String>,
    streamed_bytes: usize,
}

pub struct LoopbackSession {
    id: ConnectionId,
    prompt_name: String,
    active: AtomicBool,
    inner: Mutex<LoopbackInner>,
}

impl LoopbackSession {
    fn new(id: ConnectionId, events: mpsc::Sender<OutboundEvent>) -> Self {
        Self {
            id,
            prompt_name: Uuid::new_v4().to_string(),
            active: AtomicBool::new(true),
            inner: Mutex::new(LoopbackInner {
                state: SessionState::Uninitialized,
                last_activity: Instant::now(),
                events: Some(events),
                system_prompt: None,
                audio_content_id: None,
                streamed_bytes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check `allowed`, move to `next`, touch the activity clock and hand
    /// back a sender for any event the operation emits.
    fn advance(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
        next: SessionState,
    ) -> Result<Option<mpsc::Sender<OutboundEvent>>, SessionError> {
        let mut inner = self.lock();
        if inner.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if !allowed.contains(&inner.state) {
            return Err(SessionError::OutOfOrder {
                operation,
                state: inner.state,
            });
        }
        inner.state = next;
        inner.last_activity = std::cmp::max(inner.last_activity, Instant::now());
        Ok(inner.events.clone())
    }

    async fn emit(sender: Option<mpsc::Sender<OutboundEvent>>, event: OutboundEvent) -> Result<(), SessionError> {
        match sender {
            Some(sender) => sender
                .send(event)
                .await
                .map_err(|_| SessionError::Backend("event stream receiver dropped".to_string())),
            None => Ok(()),
        }
    }

    fn release(&self) -> Option<mpsc::Sender<OutboundEvent>> {
        self.active.store(false, Ordering::SeqCst);
        let mut inner = self.lock();
        inner.state = SessionState::Closed;
        inner.events.take()
    }
}

#[async_trait]
impl SessionControl for LoopbackSession {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    async fn end_audio_content(&self) -> Result<(), SessionError> {
        let was_streaming = self.lock().state == SessionState::AudioActive;
        let sender = self.advance(
            "endAudioContent",
            &[
                SessionState::Created,
                SessionState::PromptStarted,
                SessionState::AudioActive,
                SessionState::Closing,
            ],
            SessionState::Closing,
        )?;

        if was_streaming {
            let content_id = self.lock().audio_content_id.take();
            Self::emit(
                sender,
                OutboundEvent::ContentEnd(json!({
                    "contentId": content_id,
                    "type": "AUDIO",
                    "stopReason": "END_TURN",
                })),
            )
            .await?;
        }
        Ok(())
    }

    async fn end_prompt(&self) -> Result<(), SessionError> {
        self.advance("endPrompt", &[SessionState::Closing], SessionState::Closing)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        let sender = self.release();
        let streamed = self.lock().streamed_bytes;
        debug!(connection_id = %self.id, streamed_bytes = streamed, "Loopback session closed");
        Self::emit(sender, OutboundEvent::StreamComplete).await
    }

    fn force_close(&self) -> Result<(), SessionError> {
        if self.release().is_some() {
            debug!(connection_id = %self.id, "Loopback session force closed");
        }
        Ok(())
    }
}

#[async_trait]
impl StreamSession for LoopbackSession {
    async fn initiate(&self) -> Result<(), SessionError> {
        self.advance("initiate", &[SessionState::Uninitialized], SessionState::Created)?;
        Ok(())
    }

    async fn setup_prompt_start(&self) -> Result<(), SessionError> {
        self.advance(
            "setupPromptStart",
            &[SessionState::Created],
            SessionState::PromptStarted,
        )?;
        Ok(())
    }

    async fn setup_system_prompt(&self, text: &str) -> Result<(), SessionError> {
        self.advance(
            "setupSystemPrompt",
            &[SessionState::PromptStarted],
            SessionState::PromptStarted,
        )?;
        self.lock().system_prompt = Some(text.to_string());
        Ok(())
    }

    async fn setup_start_audio(&self) -> Result<(), SessionError> {
        let sender = self.advance(
            "setupStartAudio",
            &[SessionState::PromptStarted],
            SessionState::AudioActive,
        )?;

        let content_id = Uuid::new_v4().to_string();
        self.lock().audio_content_id = Some(content_id.clone());
        Self::emit(
            sender,
            OutboundEvent::ContentStart(json!({
                "promptName": self.prompt_name,
                "contentId": content_id,
                "type": "AUDIO",
                "role": "USER",
            })),
        )
        .await
    }

    async fn stream_audio(&self, pcm: &[u8]) -> Result<(), SessionError> {
        let sender = self.advance(
            "streamAudio",
            &[SessionState::AudioActive],
            SessionState::AudioActive,
        )?;
        self.lock().streamed_bytes += pcm.len();

        let encoded = base64::engine::general_purpose::STANDARD.encode(pcm);
        Self::emit(
            sender,
            OutboundEvent::AudioOutput(json!({
                "promptName": self.prompt_name,
                "role": "ASSISTANT",
                "content": encoded,
            })),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::graceful_chain;

    async fn created() -> (CreatedSession, SessionState) {
        let backend = LoopbackBackend::new(16);
        let created = backend.create(&ConnectionId::from("loop")).await.unwrap();
        let state = created.control.state();
        (created, state)
    }

    #[tokio::test]
    async fn test_full_lifecycle_emits_in_order() {
        let (mut created, initial) = created().await;
        assert_eq!(initial, SessionState::Uninitialized);

        created.stream.initiate().await.unwrap();
        created.stream.setup_prompt_start().await.unwrap();
        created.stream.setup_system_prompt("be brief").await.unwrap();
        created.stream.setup_start_audio().await.unwrap();
        created.stream.stream_audio(&[1, 0, 2, 0]).await.unwrap();
        assert_eq!(created.control.state(), SessionState::AudioActive);

        graceful_chain(created.control.as_ref()).await.unwrap();
        assert_eq!(created.control.state(), SessionState::Closed);
        assert!(!created.control.is_active());

        let mut names = Vec::new();
        while let Some(event) = created.events.recv().await {
            names.push(event.name());
        }
        assert_eq!(names, vec!["contentStart", "audioOutput", "contentEnd", "streamComplete"]);
    }

    #[tokio::test]
    async fn test_audio_before_audio_start_is_rejected() {
        let (created, _) = created().await;
        created.stream.initiate().await.unwrap();
        created.stream.setup_prompt_start().await.unwrap();

        let err = created.stream.stream_audio(&[0, 0]).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::OutOfOrder {
                operation: "streamAudio",
                state: SessionState::PromptStarted,
            }
        );
    }

    #[tokio::test]
    async fn test_system_prompt_requires_prompt_start() {
        let (created, _) = created().await;
        created.stream.initiate().await.unwrap();
        let err = created.stream.setup_system_prompt("x").await.unwrap_err();
        assert!(err.to_string().contains("setupSystemPrompt"));
    }

    #[tokio::test]
    async fn test_force_close_is_idempotent_and_ends_events() {
        let (mut created, _) = created().await;
        created.stream.initiate().await.unwrap();

        assert!(created.control.force_close().is_ok());
        assert!(created.control.force_close().is_ok());
        assert_eq!(created.control.state(), SessionState::Closed);
        assert!(created.events.recv().await.is_none());

        assert_eq!(created.stream.setup_prompt_start().await, Err(SessionError::Closed));
        assert!(created.control.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_force_close_after_partial_chain() {
        let (created, _) = created().await;
        created.stream.initiate().await.unwrap();
        created.stream.setup_prompt_start().await.unwrap();
        created.control.end_audio_content().await.unwrap();
        assert_eq!(created.control.state(), SessionState::Closing);

        assert!(created.control.force_close().is_ok());
        assert!(!created.control.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_clock_moves_forward() {
        let (created, _) = created().await;
        let before = created.control.last_activity();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        created.stream.initiate().await.unwrap();
        assert!(created.control.last_activity() >= before + std::time::Duration::from_secs(5));
    }
}
