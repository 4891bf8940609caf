//! WebSocket transport for `/ws/session`.
//!
//! ## Actor Model:
//! Each connection is one actor. The actor never calls the session itself:
//! it parses frames into [`ClientEvent`]s and posts them into the
//! connection's inbox, where the handler task processes them in order.
//! Outbound events come back to the actor as [`Outbound`] messages.

use crate::audio::AudioPayload;
use crate::config::SessionConfig;
use crate::connection::handler::{serve, ConnectionContext};
use crate::connection::{ClientEvent, ClientSink, Inbound};
use crate::session::{ConnectionId, OutboundEvent};
use crate::state::{AppState, SessionMetrics};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Relayed or synthesized event to write to the client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outbound(pub OutboundEvent);

/// Close the WebSocket after teardown.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseSocket;

/// [`ClientSink`] backed by the connection's actor address.
///
/// Sends to an actor that has already stopped are dropped.
#[derive(Clone)]
pub struct SocketSink(Addr<ClientSocket>);

impl ClientSink for SocketSink {
    fn send(&self, event: OutboundEvent) {
        self.0.do_send(Outbound(event));
    }

    fn close(&self) {
        self.0.do_send(CloseSocket);
    }
}

pub struct ClientSocket {
    id: ConnectionId,
    /// Taken when the actor starts and handed to the handler task
    context: Option<ConnectionContext>,
    metrics: Arc<SessionMetrics>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl ClientSocket {
    pub fn new(context: ConnectionContext, config: &SessionConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            id: ConnectionId::generate(),
            metrics: context.metrics.clone(),
            context: Some(context),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            heartbeat_interval: config.heartbeat_interval(),
            client_timeout: config.client_timeout(),
            last_heartbeat: Instant::now(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn forward(&self, event: ClientEvent) {
        if self.inbox_tx.send(Inbound::Client(event)).is_err() {
            debug!(connection_id = %self.id, "Handler already finished, dropping client event");
        }
    }

    fn write(&self, event: &OutboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(connection_id = %self.id, error = %err, "Failed to serialize outbound event"),
        }
    }
}

/// Parse one text frame, or build the `error` event reporting why it failed.
pub fn parse_frame(text: &str) -> Result<ClientEvent, OutboundEvent> {
    serde_json::from_str::<ClientEvent>(text)
        .map_err(|err| OutboundEvent::error("Invalid client message", err))
}

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.id, "WebSocket connection started");

        let client_timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(connection_id = %act.id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        if let (Some(context), Some(inbox_rx)) = (self.context.take(), self.inbox_rx.take()) {
            let sink = SocketSink(ctx.address());
            tokio::spawn(serve(
                context,
                self.id.clone(),
                sink,
                self.inbox_tx.clone(),
                inbox_rx,
            ));
        }
    }

    /// Every way the actor can stop counts as a disconnect for the handler.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.id, "WebSocket connection stopped");
        let _ = self.inbox_tx.send(Inbound::Disconnect);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match parse_frame(&text) {
                Ok(event) => self.forward(event),
                Err(error_event) => {
                    warn!(connection_id = %self.id, "Received malformed client message");
                    self.metrics.record_event_error();
                    self.write(&error_event, ctx);
                }
            },
            Ok(ws::Message::Binary(data)) => {
                self.forward(ClientEvent::AudioInput(AudioPayload::Raw(data.to_vec())));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        self.write(&msg.0, ctx);
    }
}

impl Handler<CloseSocket> for ClientSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Each upgrade gets a fresh connection identity and its own actor; the
/// session is created once the actor starts.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let socket = ClientSocket::new(state.connection_context(), &state.config.session);
    info!(
        connection_id = %socket.id(),
        peer = ?req.connection_info().peer_addr(),
        "New session connection request"
    );
    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_frame_accepts_client_events() {
        assert_eq!(parse_frame(r#"{"event":"audioStart"}"#), Ok(ClientEvent::AudioStart));
    }

    #[test]
    fn test_malformed_frame_becomes_error_event() {
        for frame in [r#"{"event":"nope"}"#, "not json", r#"{"event":"systemPrompt"}"#] {
            let event = parse_frame(frame).unwrap_err();
            let wire = serde_json::to_value(&event).unwrap();
            assert_eq!(wire["event"], "error");
            assert_eq!(wire["data"]["message"], json!("Invalid client message"));
            assert!(wire["data"]["details"].as_str().is_some());
        }
    }
}
