//! The scrape-facing HTTP endpoint.
//!
//! `GET /<path>` — looks like an ordinary metrics endpoint, but the fetch
//! happens on whichever agent registered `<path>`. The handler enqueues a
//! scrape for that agent, then waits for the response in bounded poll
//! intervals so it can notice a dead agent, an aged-out request, or proxy
//! shutdown without needing cancellation support from the transport.
//!
//! Status mapping: 404 unknown path, 503 for queue-full / agent-gone /
//! timeout / shutdown, otherwise the upstream status (body and content-type
//! passed through for status < 400, body suppressed for >= 400).

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{ACCEPT, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;

use crate::registry::ScrapeContext;
use crate::state::AppState;

/// Fallback handler for scrape requests on any path.
pub async fn handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let path = uri.path().trim_start_matches('/');
    let agent_id = match state.registry().route_by_path(path) {
        Some(agent_id) => agent_id,
        None => {
            tracing::info!(path, "request for unregistered path");
            return empty_response(StatusCode::NOT_FOUND);
        }
    };

    let accept = header_string(&headers, ACCEPT.as_str());
    let ctx = state.registry().new_scrape(&agent_id, path, accept);
    if let Err(err) = state.registry().enqueue(&ctx) {
        tracing::warn!(path, agent_id = %agent_id, error = %err, "scrape rejected");
        return empty_response(StatusCode::SERVICE_UNAVAILABLE);
    }

    let completed = wait_for_response(&state, &ctx, &agent_id).await;

    // The waiter owns cleanup on every exit path, so abandoned scrapes
    // never leak out of the registry.
    state.registry().remove(ctx.scrape_id());

    if !completed {
        tracing::info!(
            path,
            agent_id = %agent_id,
            scrape_id = ctx.scrape_id(),
            "scrape abandoned"
        );
        return empty_response(StatusCode::SERVICE_UNAVAILABLE);
    }

    tracing::debug!(scrape_id = ctx.scrape_id(), "scrape resolved");
    render(&ctx, &headers)
}

/// Poll for completion in bounded intervals, re-checking the abort guards
/// on every wake. Returns false if a guard fired before the agent answered.
async fn wait_for_response(state: &AppState, ctx: &ScrapeContext, agent_id: &str) -> bool {
    let config = state.config();
    loop {
        if ctx.wait_complete(config.poll_interval).await {
            return true;
        }
        if !state.registry().is_valid_agent(agent_id)
            || ctx.age() >= config.scrape_timeout
            || state.is_shutting_down()
        {
            return false;
        }
    }
}

/// Render a resolved scrape as the HTTP response.
fn render(ctx: &ScrapeContext, request_headers: &HeaderMap) -> Response {
    let scrape = match ctx.response() {
        Some(scrape) => scrape,
        None => return empty_response(StatusCode::SERVICE_UNAVAILABLE),
    };

    let status =
        StatusCode::from_u16(scrape.status_code).unwrap_or(StatusCode::BAD_GATEWAY);

    // No body on error status codes.
    if status.as_u16() >= 400 {
        return empty_response(status);
    }

    let mut builder = Response::builder()
        .status(status)
        .header(CACHE_CONTROL, "no-cache");
    if !scrape.content_type.is_empty() {
        builder = builder.header(CONTENT_TYPE, scrape.content_type.clone());
    }
    // The upstream body is already gzip-encoded when the scraper asked for
    // it; only the header is echoed through.
    if let Some(accept_encoding) = header_string(request_headers, ACCEPT_ENCODING.as_str()) {
        if accept_encoding.contains("gzip") {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }
    }

    match builder.body(Body::from(scrape.text.clone())) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(scrape_id = ctx.scrape_id(), error = %err, "malformed upstream response");
            empty_response(StatusCode::BAD_GATEWAY)
        }
    }
}

fn empty_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .header(CACHE_CONTROL, "no-cache")
        .body(Body::empty())
        .unwrap_or_default()
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
