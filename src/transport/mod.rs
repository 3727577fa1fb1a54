//! Bidirectional session transport: a `WebSocket` endpoint where each frame
//! carries `{kind, payload, timestamp}`. Grounded in the teacher's
//! `gateway/mod.rs` (axum `Router` + `State` pattern), generalized from its
//! REST/webhook surface into a single upgraded connection per session that
//! forwards onto the `EventBus` and `SessionRegistry`.

use crate::bus::{Event, EventBus, EventPayload};
use crate::observability::EventKind;
use crate::session::{Session, SessionRegistry};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl Frame {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Credentials presented on connect: a domain key plus either a user token
/// or a key-id/secret-key pair.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub domain_key: String,
    pub user_token: Option<String>,
    pub key_id: Option<String>,
    pub secret_key: Option<String>,
}

impl Credentials {
    fn has_identity(&self) -> bool {
        self.user_token.is_some() || (self.key_id.is_some() && self.secret_key.is_some())
    }
}

#[derive(Clone)]
pub struct TransportState {
    pub sessions: Arc<SessionRegistry>,
    pub bus: Arc<EventBus>,
    pub expected_domain_key: String,
}

pub fn router(state: TransportState) -> Router {
    Router::new().route("/ws", get(upgrade_handler)).with_state(state)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<TransportState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn authenticate(expected_domain_key: &str, credentials: &Credentials) -> Result<(), &'static str> {
    if credentials.domain_key != expected_domain_key {
        return Err("invalid domain key");
    }
    if !credentials.has_identity() {
        return Err("missing user token or key-id/secret-key pair");
    }
    Ok(())
}

async fn handle_socket(mut socket: WebSocket, state: TransportState) {
    let Some(Ok(Message::Text(first))) = socket.recv().await else {
        let _ = socket
            .send(Message::Text(
                Frame::new("agent:connection:error", serde_json::json!({"reason": "no handshake frame"}))
                    .to_json()
                    .into(),
            ))
            .await;
        return;
    };

    let credentials: Credentials = match serde_json::from_str(&first) {
        Ok(c) => c,
        Err(e) => {
            let _ = socket
                .send(Message::Text(
                    Frame::new("agent:connection:error", serde_json::json!({"reason": e.to_string()}))
                        .to_json()
                        .into(),
                ))
                .await;
            return;
        }
    };

    if let Err(reason) = authenticate(&state.expected_domain_key, &credentials) {
        let _ = socket
            .send(Message::Text(
                Frame::new("agent:connection:error", serde_json::json!({"reason": reason}))
                    .to_json()
                    .into(),
            ))
            .await;
        return;
    }

    let agent_id = credentials
        .key_id
        .clone()
        .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4()));
    let session_id = Uuid::new_v4().to_string();
    let session = Session::new(&session_id, &agent_id);
    state.sessions.register(session);
    state.bus.emit(
        Event::new(EventKind::SessionConnected, EventPayload::Empty).with_agent(agent_id.clone()),
    );
    info!(session_id = %session_id, agent_id = %agent_id, "session connected");

    if socket
        .send(Message::Text(
            Frame::new(
                "agent:connected",
                serde_json::json!({"session_id": session_id, "agent_id": agent_id}),
            )
            .to_json()
            .into(),
        ))
        .await
        .is_err()
    {
        state.sessions.disconnect(&session_id);
        return;
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let subscriptions = subscribe_outbound(&state, &session_id, &agent_id);
    let mut outbound_rx = subscriptions.rx;

    let forwarder = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_sender.send(Message::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        match message {
            Message::Text(text) => {
                state.sessions.heartbeat(&session_id);
                match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => route_inbound_frame(&state, &session_id, &agent_id, frame),
                    Err(e) => warn!(error = %e, "dropped malformed frame"),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    for (kind, id) in subscriptions.handler_ids {
        state.bus.unsubscribe(kind, id);
    }
    forwarder.abort();

    state.sessions.disconnect(&session_id);
    state.bus.emit(
        Event::new(EventKind::SessionDisconnected, EventPayload::Empty).with_agent(agent_id),
    );
}

struct OutboundSubscriptions {
    rx: mpsc::UnboundedReceiver<Frame>,
    handler_ids: Vec<(EventKind, crate::bus::HandlerId)>,
}

/// Subscribes the session to every event kind and forwards bus events back
/// out over its websocket: channel-tagged events only reach sessions that
/// joined that channel, and agent-tagged events only reach the session they
/// were addressed to. Events with neither tag (e.g. `config:changed`) reach
/// every session.
fn subscribe_outbound(state: &TransportState, session_id: &str, agent_id: &str) -> OutboundSubscriptions {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut handler_ids = Vec::new();

    for &kind in EventKind::ALL {
        let sessions = state.sessions.clone();
        let session_id = session_id.to_string();
        let agent_id = agent_id.to_string();
        let tx = tx.clone();
        let id = state.bus.subscribe(kind, move |event| {
            let allowed = match (&event.channel_id, &event.agent_id) {
                (Some(channel), _) => sessions
                    .get(&session_id)
                    .map(|s| s.channels.contains(channel))
                    .unwrap_or(false),
                (None, Some(aid)) => aid == &agent_id,
                (None, None) => true,
            };
            if allowed {
                let _ = tx.send(Frame::new(event.kind.as_str(), event.data.as_json()));
            }
        });
        handler_ids.push((kind, id));
    }

    OutboundSubscriptions { rx, handler_ids }
}

fn route_inbound_frame(state: &TransportState, session_id: &str, agent_id: &str, frame: Frame) {
    if frame.kind == "agent:heartbeat" {
        state.sessions.heartbeat(session_id);
        return;
    }
    // Every other inbound frame is mirrored onto the bus verbatim; component
    // owners (dispatcher, scheduler, coordinator) subscribe by event kind.
    // Kinds outside the closed taxonomy are dropped rather than guessed at.
    let Some(kind) = EventKind::parse(&frame.kind) else {
        warn!(kind = %frame.kind, "dropped frame with unknown event kind");
        return;
    };
    state.bus.emit(
        Event::new(kind, EventPayload::Json(frame.payload)).with_agent(agent_id.to_string()),
    );
}

impl Frame {
    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let frame = Frame::new("tool:called", serde_json::json!({"x": 1}));
        let json = frame.to_json();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "tool:called");
    }

    #[test]
    fn authenticate_rejects_wrong_domain_key() {
        let creds = Credentials {
            domain_key: "wrong".into(),
            user_token: Some("t".into()),
            key_id: None,
            secret_key: None,
        };
        assert!(authenticate("expected", &creds).is_err());
    }

    #[test]
    fn authenticate_requires_an_identity() {
        let creds = Credentials {
            domain_key: "expected".into(),
            user_token: None,
            key_id: None,
            secret_key: None,
        };
        assert!(authenticate("expected", &creds).is_err());
    }

    fn transport_state() -> TransportState {
        let bus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionRegistry::new(bus.clone(), Default::default()));
        TransportState {
            sessions,
            bus,
            expected_domain_key: "expected".into(),
        }
    }

    #[test]
    fn outbound_subscription_forwards_matching_channel_events_only() {
        let state = transport_state();
        state.sessions.register(Session::new("sess-1", "agent-1"));
        state.sessions.join_channel("sess-1", "general");
        let mut subs = subscribe_outbound(&state, "sess-1", "agent-1");

        state.bus.emit(
            Event::new(EventKind::TaskAdded, EventPayload::Empty).with_channel("general"),
        );
        state.bus.emit(
            Event::new(EventKind::TaskAdded, EventPayload::Empty).with_channel("other"),
        );

        let forwarded = subs.rx.try_recv().unwrap();
        assert_eq!(forwarded.kind, "task:added");
        assert!(subs.rx.try_recv().is_err());
    }

    #[test]
    fn outbound_subscription_forwards_agent_targeted_events_to_that_agent_only() {
        let state = transport_state();
        state.sessions.register(Session::new("sess-1", "agent-1"));
        let mut subs = subscribe_outbound(&state, "sess-1", "agent-1");

        state.bus.emit(
            Event::new(EventKind::OrparError, EventPayload::Empty).with_agent("agent-2"),
        );
        assert!(subs.rx.try_recv().is_err());

        state.bus.emit(
            Event::new(EventKind::OrparError, EventPayload::Empty).with_agent("agent-1"),
        );
        let forwarded = subs.rx.try_recv().unwrap();
        assert_eq!(forwarded.kind, "orpar:error");
    }

    #[test]
    fn authenticate_accepts_key_id_secret_pair() {
        let creds = Credentials {
            domain_key: "expected".into(),
            user_token: None,
            key_id: Some("k".into()),
            secret_key: Some("s".into()),
        };
        assert!(authenticate("expected", &creds).is_ok());
    }
}
