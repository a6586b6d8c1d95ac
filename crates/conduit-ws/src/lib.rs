//! WebSocket fan-out bridge (C10): subscribes to an [`Engine`]'s typed event
//! bus and re-broadcasts every event as `{"type": ..., "data": ...}` to a
//! dynamic set of connected clients, evicting dead ones as it finds them.
//!
//! The actual HTTP routing, TLS, and static-file serving that gets a
//! [`WebSocket`] into [`handle_socket`] belongs to the embedding
//! application; this crate only owns what happens once a socket exists.

mod protocol;

pub use protocol::{ClientMessage, ServerMessage, WsError};

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use conduit_core::{Engine, Event, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry of connected clients plus the engine they're all watching.
/// `clients` is read as a snapshot under the lock and written to concurrent
/// with in-flight sends, so a dead client is never discovered mid-broadcast
/// for a different client's sake — only ever after its own send fails.
pub struct ClientHub {
    engine: Arc<Engine>,
    clients: DashMap<ClientId, mpsc::UnboundedSender<WsMessage>>,
}

impl ClientHub {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        let hub = Arc::new(Self { engine, clients: DashMap::new() });
        subscribe_to_bus(hub.clone());
        hub
    }

    fn register(&self, tx: mpsc::UnboundedSender<WsMessage>) -> ClientId {
        let id = ClientId::new();
        self.clients.insert(id, tx);
        id
    }

    fn unregister(&self, id: ClientId) {
        self.clients.remove(&id);
    }

    fn send_to(&self, id: ClientId, message: &ServerMessage) {
        if let Some(tx) = self.clients.get(&id) {
            let _ = tx.send(WsMessage::text(message.to_json()));
        }
    }

    /// Broadcasts to every connected client, dropping any whose channel has
    /// closed. Not only the originating client receives the result of its
    /// own `chat` — every viewer does, preserving multi-viewer semantics.
    pub fn broadcast(&self, message: &ServerMessage) {
        let text = message.to_json();
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter_map(|entry| {
                if entry.value().send(WsMessage::text(text.clone())).is_err() {
                    Some(*entry.key())
                } else {
                    None
                }
            })
            .collect();
        for id in dead {
            self.clients.remove(&id);
        }
    }

    fn broadcast_engine_state(&self) {
        self.broadcast(&ServerMessage::new(
            "engine_state",
            json!({ "state": self.engine.engine_state() }),
        ));
    }

    async fn handle_client_message(self: &Arc<Self>, id: ClientId, raw: &str) {
        let parsed = match ClientMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                self.send_to(id, &ServerMessage::error(e.to_string()));
                return;
            }
        };

        match parsed {
            ClientMessage::Chat { prompt } => {
                let engine = self.engine.clone();
                let hub = self.clone();
                tokio::spawn(async move {
                    let response = engine.chat(&prompt, &[]).await;
                    let message = match response {
                        Ok(r) => ServerMessage::new("chat_response", serde_json::to_value(r).unwrap_or_default()),
                        Err(e) => ServerMessage::error(e.to_string()),
                    };
                    hub.broadcast(&message);
                });
            }
            ClientMessage::Stop => {
                if let Err(e) = self.engine.stop().await {
                    self.send_to(id, &ServerMessage::error(e.to_string()));
                }
            }
            ClientMessage::Ping => {
                self.send_to(id, &ServerMessage::new("pong", json!({})));
            }
            ClientMessage::ClearHistory => {
                self.engine.clear_history();
                self.broadcast(&ServerMessage::new("history_cleared", json!({})));
            }
            ClientMessage::Switch { provider } => match parse_provider(&provider) {
                Some(provider) => {
                    if let Err(e) = self.engine.switch_provider(provider).await {
                        self.send_to(id, &ServerMessage::error(e.to_string()));
                    }
                }
                None => self.send_to(id, &ServerMessage::error(format!("unknown provider: {provider}"))),
            },
            ClientMessage::ResumeSession { session_id } => {
                if let Err(e) = self.engine.resume_session(&session_id).await {
                    self.send_to(id, &ServerMessage::error(e.to_string()));
                }
            }
            ClientMessage::NewSession => {
                if let Err(e) = self.engine.stop().await.and(self.engine.start().await) {
                    self.send_to(id, &ServerMessage::error(e.to_string()));
                }
            }
            ClientMessage::PermissionResponse { request_id, .. } => {
                // Tool permission is decided against the configured policy
                // at call time; there's no pending request on this side to
                // resolve against. Logged so a stray reply isn't silent.
                debug!(request_id, "permission_response has no pending request to resolve");
            }
        }
    }
}

fn parse_provider(name: &str) -> Option<Provider> {
    serde_json::from_value(json!(name)).ok()
}

/// Drives one already-upgraded WebSocket connection: registers it with the
/// hub, forwards bus-originated messages out, and dispatches inbound client
/// messages until either side closes.
pub async fn handle_socket(socket: WebSocket, hub: Arc<ClientHub>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let id = hub.register(tx);
    debug!(client = %id, "websocket client connected");

    hub.send_to(id, &ServerMessage::new("connected", json!({ "client_id": id.to_string() })));

    let forward = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        if let WsMessage::Text(text) = message {
            hub.handle_client_message(id, &text).await;
        }
    }

    hub.unregister(id);
    forward.abort();
    debug!(client = %id, "websocket client disconnected");
}

const STATE_CHANGING_TAGS: &[&str] = &["thinking", "tool", "state", "text"];

/// Subscribes the hub to the engine's bus: every typed event is serialized
/// once and broadcast to a snapshot of connected clients; a coarse
/// `engine_state` message follows any event that might have moved the
/// engine's derived UI state.
fn subscribe_to_bus(hub: Arc<ClientHub>) {
    let bus = hub.engine.bus();
    let for_events = hub.clone();
    bus.subscribe_any(Arc::new(move |event: &Event| {
        let tag = event.kind.tag();
        let data = match serde_json::to_value(&event.kind) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to serialize event for websocket fan-out: {e}");
                return;
            }
        };
        for_events.broadcast(&ServerMessage::new(tag, data));
        if STATE_CHANGING_TAGS.contains(&tag) {
            for_events.broadcast_engine_state();
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::EngineConfig;

    fn test_hub() -> Arc<ClientHub> {
        let mut config = EngineConfig::default();
        config.bridge.executable = "true".to_string();
        config.health_check_interval = None;
        let engine = Engine::new(config).unwrap();
        ClientHub::new(engine)
    }

    #[tokio::test]
    async fn broadcast_delivers_to_registered_clients_and_drops_dead_ones() {
        let hub = test_hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.register(tx);

        hub.broadcast(&ServerMessage::new("ping_test", json!({})));
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, WsMessage::Text(_)));

        drop(rx);
        hub.broadcast(&ServerMessage::new("ping_test", json!({})));
        assert!(!hub.clients.contains_key(&id));
    }

    #[tokio::test]
    async fn unknown_client_message_type_yields_an_error_reply() {
        let hub = test_hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.register(tx);

        hub.handle_client_message(id, r#"{"type": "not_a_real_type"}"#).await;

        let WsMessage::Text(text) = rx.recv().await.unwrap() else { panic!("expected text frame") };
        assert!(text.contains("error"));
    }
}
