//! Introspection endpoint for operators.
//!
//! `GET /debug/agents` — JSON summary of connected agents, their registered
//! paths, outbound queue depths, and the number of in-flight scrapes.
//! Unauthenticated, intended for internal networks only.

use axum::extract::State;
use axum::Json;

use crate::state::AppState;

/// Handler for `GET /debug/agents`.
pub async fn handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let agents: Vec<serde_json::Value> = state
        .registry()
        .agents()
        .iter()
        .map(|conn| {
            serde_json::json!({
                "agent_id": conn.agent_id(),
                "remote_addr": conn.remote_addr(),
                "hostname": conn.hostname(),
                "valid": conn.is_valid(),
                "paths": conn.registered_paths(),
                "queued": conn.queued(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "agents": agents,
        "pending_scrapes": state.registry().pending_scrapes(),
    }))
}
