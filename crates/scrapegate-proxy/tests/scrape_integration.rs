//! Integration tests for the scrape endpoint.
//!
//! These tests exercise the HTTP facade through axum's tower service
//! interface (no TCP). The agent side is simulated by driving the registry
//! directly: connect, register a path, take the outbound queue receiver,
//! and resolve scrapes the way the WebSocket bridge would.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tokio::sync::{mpsc, watch};
use tower::ServiceExt;

use scrapegate_common::protocol::{ScrapeRequestPayload, ScrapeResponsePayload};
use scrapegate_proxy::state::{AppState, ProxyConfig};
use scrapegate_proxy::{debug, scrape};

/// Short timeouts so abandonment paths finish quickly.
fn test_config() -> ProxyConfig {
    ProxyConfig {
        queue_capacity: 8,
        scrape_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(50),
    }
}

fn test_app(config: ProxyConfig) -> (Router, AppState, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::new(config, shutdown_rx);
    let app = Router::new()
        .route("/debug/agents", axum::routing::get(debug::handler))
        .fallback(scrape::handler)
        .with_state(state.clone());
    (app, state, shutdown_tx)
}

/// Simulate an agent connection that has claimed `path`, returning its id
/// and the outbound queue receiver the bridge would drain.
fn connect_agent(state: &AppState, path: &str) -> (String, mpsc::Receiver<ScrapeRequestPayload>) {
    let conn = state.registry().connect("203.0.113.7:40000");
    let agent_id = conn.agent_id().to_string();
    state
        .registry()
        .register_agent(&agent_id, "test-host")
        .unwrap();
    state.registry().register_path(&agent_id, path).unwrap();
    let outbound = conn.take_outbound().unwrap();
    (agent_id, outbound)
}

/// Answer every queued scrape with the given upstream result.
fn spawn_responder(
    state: &AppState,
    mut outbound: mpsc::Receiver<ScrapeRequestPayload>,
    status_code: u16,
    body: &str,
    content_type: &str,
) {
    let state = state.clone();
    let body = body.to_string();
    let content_type = content_type.to_string();
    tokio::spawn(async move {
        while let Some(request) = outbound.recv().await {
            state.registry().resolve(
                request.scrape_id,
                ScrapeResponsePayload {
                    agent_id: request.agent_id,
                    scrape_id: request.scrape_id,
                    status_code,
                    text: body.clone(),
                    content_type: content_type.clone(),
                    valid: status_code < 400,
                },
            );
        }
    });
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn round_trip_passes_body_and_content_type_through() {
    let (app, state, _shutdown) = test_app(test_config());
    let (_agent_id, outbound) = connect_agent(&state, "metrics");
    spawn_responder(&state, outbound, 200, "foo 1", "text/plain");

    let resp = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(body_string(resp).await, "foo 1");

    // The waiter cleaned up after itself.
    assert_eq!(state.registry().pending_scrapes(), 0);
}

#[tokio::test]
async fn unknown_path_returns_404_with_no_state() {
    let (app, state, _shutdown) = test_app(test_config());

    let resp = app.oneshot(get("/never_registered")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(body_string(resp).await.is_empty());
    assert_eq!(state.registry().pending_scrapes(), 0);
}

#[tokio::test]
async fn upstream_error_status_suppresses_body() {
    let (app, state, _shutdown) = test_app(test_config());
    let (_agent_id, outbound) = connect_agent(&state, "metrics");
    spawn_responder(&state, outbound, 500, "internal error text", "text/plain");

    let resp = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(resp).await.is_empty());
}

#[tokio::test]
async fn gzip_accept_encoding_is_echoed() {
    let (app, state, _shutdown) = test_app(test_config());
    let (_agent_id, outbound) = connect_agent(&state, "metrics");
    spawn_responder(&state, outbound, 200, "foo 1", "text/plain");

    let request = Request::builder()
        .uri("/metrics")
        .header("accept-encoding", "gzip, deflate")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(request).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("content-encoding").unwrap(), "gzip");
}

#[tokio::test]
async fn plain_request_gets_no_content_encoding() {
    let (app, state, _shutdown) = test_app(test_config());
    let (_agent_id, outbound) = connect_agent(&state, "metrics");
    spawn_responder(&state, outbound, 200, "foo 1", "text/plain");

    let resp = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("content-encoding").is_none());
}

#[tokio::test]
async fn silent_agent_times_out_with_503() {
    let (app, state, _shutdown) = test_app(test_config());
    // Outbound receiver kept alive but never answered.
    let (_agent_id, _outbound) = connect_agent(&state, "metrics");

    let resp = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.registry().pending_scrapes(), 0);
}

#[tokio::test]
async fn disconnect_mid_flight_returns_503() {
    let config = ProxyConfig {
        // Generous timeout: the 503 must come from the disconnect guard,
        // not from aging out.
        scrape_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(50),
        queue_capacity: 8,
    };
    let (app, state, _shutdown) = test_app(config);
    let (agent_id, mut outbound) = connect_agent(&state, "metrics");

    // Tear the agent down as soon as its request is delivered.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let _request = outbound.recv().await.unwrap();
            state.registry().disconnect(&agent_id);
        });
    }

    let started = std::time::Instant::now();
    let resp = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "waiter did not notice the disconnect promptly"
    );
    assert_eq!(state.registry().pending_scrapes(), 0);
}

#[tokio::test]
async fn full_queue_returns_503_without_blocking() {
    let config = ProxyConfig {
        queue_capacity: 1,
        scrape_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(50),
    };
    let (app, state, _shutdown) = test_app(config);
    // Queue never drained.
    let (_agent_id, _outbound) = connect_agent(&state, "metrics");

    // First scrape occupies the only queue slot and will age out.
    let first = {
        let app = app.clone();
        tokio::spawn(async move { app.oneshot(get("/metrics")).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second scrape hits capacity and fails fast.
    let started = std::time::Instant::now();
    let resp = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(started.elapsed() < Duration::from_millis(200));

    assert_eq!(first.await.unwrap().status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.registry().pending_scrapes(), 0);
}

#[tokio::test]
async fn shutdown_aborts_waiting_scrapes() {
    let config = ProxyConfig {
        scrape_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(50),
        queue_capacity: 8,
    };
    let (app, state, shutdown) = test_app(config);
    let (_agent_id, _outbound) = connect_agent(&state, "metrics");

    let waiter = {
        let app = app.clone();
        tokio::spawn(async move { app.oneshot(get("/metrics")).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.send(true).unwrap();

    let resp = waiter.await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.registry().pending_scrapes(), 0);
}

#[tokio::test]
async fn non_get_methods_are_rejected() {
    let (app, state, _shutdown) = test_app(test_config());
    let (_agent_id, outbound) = connect_agent(&state, "metrics");
    spawn_responder(&state, outbound, 200, "foo 1", "text/plain");

    let request = Request::builder()
        .uri("/metrics")
        .method("POST")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(request).await.unwrap();

    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn interleaved_scrapes_get_their_own_bodies() {
    let (app, state, _shutdown) = test_app(ProxyConfig {
        queue_capacity: 64,
        scrape_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
    });

    // One agent serving two paths: one fast, one slow. Slow responses land
    // after fast ones, so correlation must come from the scrape id alone.
    let conn = state.registry().connect("203.0.113.8:40000");
    let agent_id = conn.agent_id().to_string();
    state.registry().register_path(&agent_id, "fast").unwrap();
    state.registry().register_path(&agent_id, "slow").unwrap();
    let mut outbound = conn.take_outbound().unwrap();

    {
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(request) = outbound.recv().await {
                let state = state.clone();
                tokio::spawn(async move {
                    if request.path == "slow" {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                    }
                    let body = format!("{} {}", request.path, request.scrape_id);
                    state.registry().resolve(
                        request.scrape_id,
                        ScrapeResponsePayload {
                            agent_id: request.agent_id,
                            scrape_id: request.scrape_id,
                            status_code: 200,
                            text: body,
                            content_type: "text/plain".into(),
                            valid: true,
                        },
                    );
                });
            }
        });
    }

    let mut handles = Vec::new();
    for i in 0..20 {
        let app = app.clone();
        let path = if i % 2 == 0 { "/fast" } else { "/slow" };
        handles.push(tokio::spawn(async move {
            (path, app.oneshot(get(path)).await.unwrap())
        }));
    }

    for handle in handles {
        let (path, resp) = handle.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(
            body.starts_with(path.trim_start_matches('/')),
            "scrape for {path} got response body {body:?}"
        );
    }
    assert_eq!(state.registry().pending_scrapes(), 0);
}

#[tokio::test]
async fn debug_endpoint_reports_agents() {
    let (app, state, _shutdown) = test_app(test_config());
    let (agent_id, _outbound) = connect_agent(&state, "metrics");

    let resp = app.oneshot(get("/debug/agents")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value =
        serde_json::from_str(&body_string(resp).await).unwrap();
    let agents = body["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], agent_id.as_str());
    assert_eq!(agents[0]["hostname"], "test-host");
    assert_eq!(agents[0]["paths"][0], "metrics");
    assert_eq!(body["pending_scrapes"], 0);
}
