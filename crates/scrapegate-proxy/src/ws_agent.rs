//! WebSocket endpoint for agent connections.
//!
//! Endpoint: GET /agent/ws
//!
//! Flow:
//! 1. Agent connects, sends `agent.connect`
//! 2. Proxy allocates an agent id, replies `agent.connect.response`
//! 3. Agent sends `agent.register` and one `path.register` per target
//! 4. Proxy streams `scrape.request` messages down in enqueue order
//! 5. Agent streams `scrape.response` messages up, correlated by scrape id
//!
//! One socket carries both directions; a `tokio::select!` loop drains the
//! agent's outbound queue downstream and resolves responses upstream. Any
//! socket error or close tears the agent down via `Registry::disconnect`.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::StreamExt;
use futures::SinkExt;

use scrapegate_common::protocol::{
    ConnectResponsePayload, Envelope, HeartbeatPayload, RegisterAgentPayload,
    RegisterAgentResponsePayload, RegisterPathPayload, RegisterPathResponsePayload,
    ScrapeResponsePayload,
};

use crate::state::AppState;

/// Axum handler — upgrades HTTP to WebSocket.
pub async fn handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket, remote_addr))
}

/// Main WebSocket handler for a single agent connection.
async fn handle_socket(state: AppState, socket: WebSocket, remote_addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Wait for the first message — must be agent.connect
    let conn = match ws_rx.next().await {
        Some(Ok(Message::Text(text))) => {
            let envelope: Envelope = match serde_json::from_str(&text) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(%remote_addr, "invalid first message from agent: {err}");
                    return;
                }
            };
            if envelope.msg_type != "agent.connect" {
                tracing::warn!(
                    %remote_addr,
                    msg_type = %envelope.msg_type,
                    "first message must be agent.connect"
                );
                return;
            }
            state.registry().connect(&remote_addr.to_string())
        }
        _ => return,
    };
    let agent_id = conn.agent_id().to_string();

    let response = Envelope::new(
        "agent.connect.response",
        &ConnectResponsePayload {
            agent_id: agent_id.clone(),
        },
    );
    if send_envelope(&mut ws_tx, &response).await.is_err() {
        state.registry().disconnect(&agent_id);
        return;
    }

    // The bridge owns the outbound queue receiver for the connection's life.
    let mut outbound_rx = match conn.take_outbound() {
        Some(rx) => rx,
        None => {
            tracing::error!(agent_id = %agent_id, "outbound queue already claimed");
            state.registry().disconnect(&agent_id);
            return;
        }
    };

    // Bidirectional message loop
    loop {
        tokio::select! {
            // Messages FROM the agent
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_agent_message(&state, &agent_id, &text) {
                            if send_envelope(&mut ws_tx, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::warn!(agent_id = %agent_id, error = %err, "WebSocket read error");
                        break;
                    }
                    _ => {} // Ping/Pong handled by axum
                }
            }

            // Scrape requests TO the agent, in enqueue order
            req = outbound_rx.recv() => {
                match req {
                    Some(payload) => {
                        let envelope = Envelope::new("scrape.request", &payload);
                        if send_envelope(&mut ws_tx, &envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Teardown: invalidates the connection and purges path routes. Waiters
    // for in-flight scrapes observe the invalid agent on their next wake.
    state.registry().disconnect(&agent_id);
}

/// Handle an incoming message from a connected agent. Returns the reply
/// envelope for request/response message types.
fn handle_agent_message(state: &AppState, agent_id: &str, raw: &str) -> Option<Envelope> {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(agent_id, "invalid message from agent: {err}");
            return None;
        }
    };

    match envelope.msg_type.as_str() {
        "agent.register" => {
            let payload: RegisterAgentPayload = match envelope.parse_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(agent_id, "bad agent.register payload: {err}");
                    return None;
                }
            };
            let result = state
                .registry()
                .register_agent(&payload.agent_id, &payload.hostname);
            let response = RegisterAgentResponsePayload {
                valid: result.is_ok(),
                reason: result.err().map(|err| err.to_string()),
            };
            Some(Envelope::new("agent.register.response", &response))
        }
        "path.register" => {
            let payload: RegisterPathPayload = match envelope.parse_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(agent_id, "bad path.register payload: {err}");
                    return None;
                }
            };
            let response = match state
                .registry()
                .register_path(&payload.agent_id, &payload.path)
            {
                Ok(path_id) => RegisterPathResponsePayload {
                    valid: true,
                    path_id,
                    reason: None,
                },
                Err(err) => RegisterPathResponsePayload {
                    valid: false,
                    path_id: 0,
                    reason: Some(err.to_string()),
                },
            };
            Some(Envelope::new("path.register.response", &response))
        }
        "scrape.response" => {
            if let Ok(payload) = envelope.parse_payload::<ScrapeResponsePayload>() {
                state.registry().resolve(payload.scrape_id, payload);
            }
            None
        }
        "agent.heartbeat" => {
            if let Ok(payload) = envelope.parse_payload::<HeartbeatPayload>() {
                tracing::debug!(agent_id, backlog = payload.backlog, "heartbeat");
            }
            None
        }
        other => {
            tracing::debug!(agent_id, msg_type = %other, "unhandled agent message type");
            None
        }
    }
}

async fn send_envelope(
    ws_tx: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    envelope: &Envelope,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(envelope).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}
