//! WebSocket protocol messages between scrape agents and the proxy.
//!
//! All messages are JSON-encoded and follow a common envelope format. One
//! WebSocket per agent carries the whole protocol: the connect/register
//! handshake, the downstream scrape-request stream, and the upstream
//! scrape-response stream. Responses are correlated by `scrape_id` only —
//! never by position in the stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Envelope ────────────────────────────────────────────────────────

/// The outer envelope for all WebSocket messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID (UUIDv7, time-ordered).
    pub id: String,
    /// Message type (dotted namespace, e.g. "scrape.request").
    #[serde(rename = "type")]
    pub msg_type: String,
    /// ISO 8601 timestamp.
    pub ts: DateTime<Utc>,
    /// Type-specific payload.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope with a fresh UUIDv7 and current timestamp.
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            msg_type: msg_type.into(),
            ts: Utc::now(),
            payload: serde_json::to_value(payload).expect("payload serialization"),
        }
    }

    /// Parse the payload into a concrete type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ── Agent → Proxy ───────────────────────────────────────────────────

/// First message after WebSocket connect. The proxy assigns the agent its
/// identity in the response — the agent never chooses its own id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub agent_version: String,
}

/// Registers the agent's informational hostname against its assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentPayload {
    pub agent_id: String,
    pub hostname: String,
}

/// Claims a scrape path for this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPathPayload {
    pub agent_id: String,
    pub path: String,
}

/// One completed fetch, tagged with the originating scrape id.
///
/// `valid: false` marks a synthesized error response (unknown path on the
/// agent, or a fetch I/O failure) — still a well-formed message so the
/// proxy-side waiter always resolves or times out deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeResponsePayload {
    pub agent_id: String,
    pub scrape_id: u64,
    pub status_code: u16,
    pub text: String,
    pub content_type: String,
    pub valid: bool,
}

/// Keep-alive sent when the agent has written nothing for a while.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub agent_id: String,
    /// Number of fetches currently in flight on the agent.
    pub backlog: usize,
}

// ── Proxy → Agent ───────────────────────────────────────────────────

/// Response to `agent.connect` carrying the assigned identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponsePayload {
    pub agent_id: String,
}

/// Response to `agent.register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentResponsePayload {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Response to `path.register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPathResponsePayload {
    pub valid: bool,
    /// Proxy-scoped path identifier, echoed back for agent bookkeeping.
    pub path_id: u64,
    pub reason: Option<String>,
}

/// One scrape request pushed down to the owning agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRequestPayload {
    pub agent_id: String,
    pub scrape_id: u64,
    pub path: String,
    /// The HTTP caller's Accept header, forwarded verbatim.
    pub accept: Option<String>,
}
