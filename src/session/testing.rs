//! Scripted session resource for tests.
//!
//! Records every call in order, can fail or hang any named operation, and
//! counts force-closes. Operation names match the wire vocabulary
//! (`setupPromptStart`, `streamAudio`, `endAudioContent`, ...).

use super::{
    ConnectionId, CreatedSession, OutboundEvent, SessionBackend, SessionControl, SessionError,
    SessionState, StreamSession,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub struct ScriptedSession {
    id: ConnectionId,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    hanging: Mutex<HashSet<&'static str>>,
    active: AtomicBool,
    force_closes: AtomicUsize,
    last_activity: Mutex<Instant>,
    events: Mutex<Option<mpsc::Sender<OutboundEvent>>>,
}

impl ScriptedSession {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::from(id),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            active: AtomicBool::new(true),
            force_closes: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            events: Mutex::new(None),
        })
    }

    /// Attach an event channel and return its receiving end.
    pub fn with_events(&self, capacity: usize) -> mpsc::Receiver<OutboundEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.events.lock().unwrap() = Some(tx);
        rx
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn hang_on(&self, operation: &'static str) {
        self.hanging.lock().unwrap().insert(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn force_close_count(&self) -> usize {
        self.force_closes.load(Ordering::SeqCst)
    }

    pub fn set_last_activity(&self, at: Instant) {
        *self.last_activity.lock().unwrap() = at;
    }

    /// Emit an event as the backend would.
    pub async fn emit(&self, event: OutboundEvent) {
        let sender = self.events.lock().unwrap().clone();
        if let Some(sender) = sender {
            sender.send(event).await.unwrap();
        }
    }

    fn release(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }

    async fn step(&self, operation: &'static str, label: String) -> Result<(), SessionError> {
        self.calls.lock().unwrap().push(label);
        *self.last_activity.lock().unwrap() = Instant::now();

        let hang = self.hanging.lock().unwrap().contains(operation);
        if hang {
            std::future::pending::<()>().await;
        }

        let fail = self.failing.lock().unwrap().contains(operation);
        if fail {
            return Err(SessionError::Backend(format!("{} failed", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionControl for ScriptedSession {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn state(&self) -> SessionState {
        if self.is_active() {
            SessionState::AudioActive
        } else {
            SessionState::Closed
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    async fn end_audio_content(&self) -> Result<(), SessionError> {
        self.step("endAudioContent", "endAudioContent".to_string()).await
    }

    async fn end_prompt(&self) -> Result<(), SessionError> {
        self.step("endPrompt", "endPrompt".to_string()).await
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.step("close", "close".to_string()).await?;
        self.release();
        Ok(())
    }

    fn force_close(&self) -> Result<(), SessionError> {
        self.force_closes.fetch_add(1, Ordering::SeqCst);
        self.release();
        Ok(())
    }
}

#[async_trait]
impl StreamSession for ScriptedSession {
    async fn initiate(&self) -> Result<(), SessionError> {
        self.step("initiate", "initiate".to_string()).await
    }

    async fn setup_prompt_start(&self) -> Result<(), SessionError> {
        self.step("setupPromptStart", "setupPromptStart".to_string()).await
    }

    async fn setup_system_prompt(&self, text: &str) -> Result<(), SessionError> {
        self.step("setupSystemPrompt", format!("setupSystemPrompt({})", text))
            .await
    }

    async fn setup_start_audio(&self) -> Result<(), SessionError> {
        self.step("setupStartAudio", "setupStartAudio".to_string()).await
    }

    async fn stream_audio(&self, pcm: &[u8]) -> Result<(), SessionError> {
        self.step("streamAudio", format!("streamAudio({:?})", pcm)).await
    }
}

/// Backend that hands out one pre-built scripted session, or fails.
pub struct ScriptedBackend {
    session: Mutex<Option<Arc<ScriptedSession>>>,
}

impl ScriptedBackend {
    pub fn new(session: Arc<ScriptedSession>) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(Some(session)),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(None),
        })
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn create(&self, _id: &ConnectionId) -> Result<CreatedSession, SessionError> {
        let session = self
            .session
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SessionError::Backend("backend unavailable".to_string()))?;

        let events = session.with_events(32);
        Ok(CreatedSession {
            stream: session.clone(),
            control: session,
            events,
        })
    }
}
