//! Per-connection state machine.
//!
//! A handler owns one client connection and the one session resource created
//! for it. Inbound events are taken from a single inbox and processed one at
//! a time, so no two calls for the same connection ever run concurrently.
//! Backend events are relayed by a separate task in emission order.
//!
//! ## Lifetime:
//! 1. Create and register the session, then `initiate` it
//! 2. Process client events until a disconnect or the end of the session's event stream
//! 3. Tear down: graceful chain within the cleanup budget, force-close on failure or expiry
//! 4. Flush the relay, then close the transport

use crate::audio::{chunk_levels, decode_chunk};
use crate::connection::{ClientEvent, ClientSink, Inbound, StopAudioRequest};
use crate::deadline::{self, Deadline};
use crate::registry::SessionRegistry;
use crate::session::{
    graceful_chain, ConnectionId, OutboundEvent, SessionBackend, SessionControl, StreamSession,
};
use crate::state::SessionMetrics;
use crate::summary::{ChatTurn, Summarizer};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Turns seen on this connection, fed by relayed `textOutput` events.
pub type ChatLog = Arc<Mutex<Vec<ChatTurn>>>;

/// Shared collaborators handed to every new connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub backend: Arc<dyn SessionBackend>,
    pub registry: Arc<SessionRegistry>,
    pub summarizer: Arc<Summarizer>,
    pub metrics: Arc<SessionMetrics>,
    /// Upper bound on disconnect cleanup and on the relay flush
    pub cleanup_budget: Duration,
}

pub struct ConnectionHandler<S: ClientSink> {
    ctx: ConnectionContext,
    id: ConnectionId,
    sink: S,
    stream: Arc<dyn StreamSession>,
    control: Arc<dyn SessionControl>,
    chat_log: ChatLog,
    relay: Option<JoinHandle<()>>,
    closing: bool,
}

/// Run one connection from session creation to transport close.
///
/// `inbox_tx` is the sending half of `inbox`; the relay uses it to report
/// the end of the session's event stream.
pub async fn serve<S: ClientSink>(
    ctx: ConnectionContext,
    id: ConnectionId,
    sink: S,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
) {
    ctx.metrics.record_connection_opened();
    if let Some(handler) = ConnectionHandler::open(ctx, id, sink, inbox_tx).await {
        handler.run(inbox).await;
    }
}

impl<S: ClientSink> ConnectionHandler<S> {
    /// Create, register and initiate the session.
    ///
    /// Any failure is fatal to this connection only: the client gets one
    /// `error` event, the transport is closed and `None` is returned.
    pub async fn open(
        ctx: ConnectionContext,
        id: ConnectionId,
        sink: S,
        inbox_tx: mpsc::UnboundedSender<Inbound>,
    ) -> Option<Self> {
        let created = match ctx.backend.create(&id).await {
            Ok(created) => created,
            Err(err) => {
                error!(connection_id = %id, error = %err, "Failed to create session");
                sink.send(OutboundEvent::error("Failed to initialize session", &err));
                sink.close();
                return None;
            }
        };

        if let Err(err) = ctx.registry.register(id.clone(), created.control.clone()) {
            // The entry already present belongs to someone else; only the
            // session created here is released.
            if let Err(close_err) = created.control.force_close() {
                warn!(connection_id = %id, error = %close_err, "Force-close of rejected session failed");
            }
            sink.send(OutboundEvent::error("Failed to initialize session", &err));
            sink.close();
            return None;
        }

        if let Err(err) = created.stream.initiate().await {
            error!(connection_id = %id, error = %err, "Failed to initiate session");
            if let Err(close_err) = ctx.registry.force_close(&id) {
                warn!(connection_id = %id, error = %close_err, "Force-close after failed initiate failed");
            }
            sink.send(OutboundEvent::error("Failed to initialize session", &err));
            sink.close();
            return None;
        }

        let chat_log = ChatLog::default();
        let relay = spawn_relay(
            id.clone(),
            created.events,
            sink.clone(),
            chat_log.clone(),
            inbox_tx,
        );

        info!(connection_id = %id, "Session initiated");
        Some(Self {
            ctx,
            id,
            sink,
            stream: created.stream,
            control: created.control,
            chat_log,
            relay: Some(relay),
            closing: false,
        })
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(message) = inbox.recv().await {
            match message {
                Inbound::Client(event) => self.dispatch(event).await,
                Inbound::SessionEnded => {
                    debug!(connection_id = %self.id, "Session event stream ended");
                    break;
                }
                Inbound::Disconnect => {
                    info!(connection_id = %self.id, "Client disconnected");
                    break;
                }
            }
        }
        self.teardown().await;
    }

    async fn dispatch(&mut self, event: ClientEvent) {
        let name = event.name();
        let context = failure_context(&event);
        debug!(connection_id = %self.id, event = name, "Processing client event");

        if self.closing {
            self.report(context, "Session is closing");
            return;
        }

        let outcome: anyhow::Result<()> = match event {
            ClientEvent::PromptStart => self.stream.setup_prompt_start().await.map_err(Into::into),
            ClientEvent::SystemPrompt(text) => self
                .stream
                .setup_system_prompt(&text)
                .await
                .map_err(Into::into),
            ClientEvent::AudioStart => self.stream.setup_start_audio().await.map_err(Into::into),
            ClientEvent::AudioInput(payload) => match decode_chunk(payload) {
                Ok(pcm) => {
                    let (samples, peak) = chunk_levels(&pcm);
                    trace!(connection_id = %self.id, samples, peak, "Streaming audio chunk");
                    self.stream.stream_audio(&pcm).await.map_err(Into::into)
                }
                Err(err) => Err(err.into()),
            },
            ClientEvent::StopAudio(request) => {
                self.stop_audio(request).await;
                Ok(())
            }
        };

        if let Err(err) = outcome {
            self.report(context, err);
        }
    }

    /// Summarize, send the summary, then run the graceful chain once.
    async fn stop_audio(&mut self, request: StopAudioRequest) {
        self.closing = true;

        let logged = std::mem::take(&mut *self.chat_log.lock().unwrap_or_else(PoisonError::into_inner));
        let history = if request.history.is_empty() {
            logged
        } else {
            request.history
        };

        let chat_summary = self.ctx.summarizer.summarize(&history).await;
        self.sink.send(OutboundEvent::ChatSummary { chat_summary });

        // Bounded like disconnect cleanup, so a later disconnect is not
        // stuck behind a stalled chain.
        let budget = self.ctx.cleanup_budget;
        match deadline::race(budget, graceful_chain(self.control.as_ref())).await {
            Deadline::Completed(Ok(())) => {
                self.ctx.registry.unregister(&self.id);
                self.ctx.metrics.record_graceful_close();
                info!(connection_id = %self.id, "Session closed");
            }
            Deadline::Completed(Err(err)) => {
                self.report("Error processing streaming end events", &err);
                self.force_release();
            }
            Deadline::Expired => {
                self.report(
                    "Error processing streaming end events",
                    format!("graceful close timed out after {} ms", budget.as_millis()),
                );
                self.force_release();
            }
        }
    }

    async fn teardown(mut self) {
        let budget = self.ctx.cleanup_budget;

        if self.ctx.registry.is_active(&self.id) {
            match deadline::race(budget, graceful_chain(self.control.as_ref())).await {
                Deadline::Completed(Ok(())) => {
                    self.ctx.registry.unregister(&self.id);
                    self.ctx.metrics.record_graceful_close();
                    info!(connection_id = %self.id, "Session closed on disconnect");
                }
                Deadline::Completed(Err(err)) => {
                    warn!(connection_id = %self.id, error = %err, "Graceful cleanup failed, forcing close");
                    self.force_release();
                }
                Deadline::Expired => {
                    warn!(
                        connection_id = %self.id,
                        budget_ms = budget.as_millis() as u64,
                        "Graceful cleanup timed out, forcing close"
                    );
                    self.force_release();
                }
            }
        }
        self.ctx.registry.unregister(&self.id);

        if let Some(mut relay) = self.relay.take() {
            match deadline::race(budget, &mut relay).await {
                Deadline::Completed(Ok(())) => {}
                Deadline::Completed(Err(err)) => {
                    warn!(connection_id = %self.id, error = %err, "Relay task failed");
                }
                Deadline::Expired => {
                    warn!(connection_id = %self.id, "Relay did not drain in time");
                    relay.abort();
                }
            }
        }

        self.sink.close();
        debug!(connection_id = %self.id, "Connection closed");
    }

    /// Force-close through the registry, so a concurrent reaper or shutdown
    /// removal is never duplicated.
    fn force_release(&self) {
        match self.ctx.registry.force_close(&self.id) {
            Ok(true) => self.ctx.metrics.record_forced_close(),
            Ok(false) => debug!(connection_id = %self.id, "Session already removed"),
            Err(err) => error!(connection_id = %self.id, error = %err, "Force-close failed"),
        }
    }

    fn report(&self, context: &str, err: impl std::fmt::Display) {
        warn!(connection_id = %self.id, error = %err, "{}", context);
        self.ctx.metrics.record_event_error();
        self.sink.send(OutboundEvent::error(context, err));
    }
}

fn failure_context(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::PromptStart => "Error processing prompt start",
        ClientEvent::SystemPrompt(_) => "Error processing system prompt",
        ClientEvent::AudioStart => "Error processing audio start",
        ClientEvent::AudioInput(_) => "Error processing audio",
        ClientEvent::StopAudio(_) => "Error processing streaming end events",
    }
}

fn spawn_relay<S: ClientSink>(
    id: ConnectionId,
    mut events: mpsc::Receiver<OutboundEvent>,
    sink: S,
    chat_log: ChatLog,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let OutboundEvent::TextOutput(data) = &event {
                record_turn(&chat_log, data);
            }
            trace!(connection_id = %id, event = event.name(), "Relaying session event");
            sink.send(event);
        }
        // The handler may already be gone.
        let _ = inbox_tx.send(Inbound::SessionEnded);
    })
}

fn record_turn(chat_log: &ChatLog, data: &Value) {
    let role = data.get("role").and_then(Value::as_str);
    let content = data.get("content").and_then(Value::as_str);
    if let (Some(role), Some(content)) = (role, content) {
        chat_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ChatTurn {
                role: role.to_string(),
                message: content.to_string(),
            });
    }
}
