//! Target fetching: per-path contexts and the fetch worker pool.
//!
//! Every fetch produces a well-formed response message, success or not.
//! Unknown paths and I/O failures become `valid: false` responses so the
//! proxy-side waiter always resolves or times out deterministically —
//! errors never cross the protocol boundary as errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use tokio::sync::{mpsc, Mutex};

use scrapegate_common::protocol::{ScrapeRequestPayload, ScrapeResponsePayload};

/// Immutable mapping from a registered path to its target URL.
///
/// One per configured target; `path_id` is assigned by the proxy at
/// registration and kept for bookkeeping/logs.
#[derive(Debug, Clone)]
pub struct PathContext {
    pub path_id: u64,
    pub path: String,
    pub url: String,
}

impl PathContext {
    pub fn new(path_id: u64, path: String, url: String) -> Self {
        Self { path_id, path, url }
    }

    /// Fetch the target URL and shape the outcome as a response message.
    ///
    /// Non-2xx upstream statuses are passed through with `valid: false` and
    /// no body; transport failures map to an invalid 404.
    pub async fn fetch(
        &self,
        client: &reqwest::Client,
        agent_id: &str,
        scrape_id: u64,
    ) -> ScrapeResponsePayload {
        tracing::info!(path = %self.path, url = %self.url, scrape_id, "fetching target");

        let response = match client.get(&self.url).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::info!(url = %self.url, error = %err, "target fetch failed");
                return invalid_response(agent_id, scrape_id, 404);
            }
        };

        let status_code = response.status().as_u16();
        if !response.status().is_success() {
            return invalid_response(agent_id, scrape_id, status_code);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        match response.text().await {
            Ok(text) => ScrapeResponsePayload {
                agent_id: agent_id.to_string(),
                scrape_id,
                status_code,
                text,
                content_type,
                valid: true,
            },
            Err(err) => {
                tracing::info!(url = %self.url, error = %err, "target body read failed");
                invalid_response(agent_id, scrape_id, status_code)
            }
        }
    }
}

/// A synthesized error response with the given status and no body.
pub fn invalid_response(agent_id: &str, scrape_id: u64, status_code: u16) -> ScrapeResponsePayload {
    ScrapeResponsePayload {
        agent_id: agent_id.to_string(),
        scrape_id,
        status_code,
        text: String::new(),
        content_type: String::new(),
        valid: false,
    }
}

/// Spawn the fixed-size fetch worker pool for one connection attempt.
///
/// Workers share the inbound queue receiver and exit when it closes (the
/// connection loop drops the sender) or when the response queue's receiver
/// is gone. The bounded response queue caps how far fetch results can run
/// ahead of the upstream drain.
pub fn spawn_workers(
    count: usize,
    client: reqwest::Client,
    paths: Arc<HashMap<String, PathContext>>,
    agent_id: String,
    inbound_rx: mpsc::Receiver<ScrapeRequestPayload>,
    response_tx: mpsc::Sender<ScrapeResponsePayload>,
    backlog: Arc<AtomicUsize>,
) {
    let inbound_rx = Arc::new(Mutex::new(inbound_rx));
    for worker in 0..count {
        let client = client.clone();
        let paths = paths.clone();
        let agent_id = agent_id.clone();
        let inbound_rx = inbound_rx.clone();
        let response_tx = response_tx.clone();
        let backlog = backlog.clone();
        tokio::spawn(async move {
            loop {
                let request = { inbound_rx.lock().await.recv().await };
                let Some(request) = request else { break };

                backlog.fetch_add(1, Ordering::Relaxed);
                let response = match paths.get(&request.path) {
                    Some(context) => {
                        context.fetch(&client, &agent_id, request.scrape_id).await
                    }
                    None => {
                        tracing::warn!(path = %request.path, "scrape request for unknown path");
                        invalid_response(&agent_id, request.scrape_id, 404)
                    }
                };
                backlog.fetch_sub(1, Ordering::Relaxed);

                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
            tracing::debug!(worker, "fetch worker stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;

    async fn serve_stub() -> SocketAddr {
        let app = axum::Router::new()
            .route(
                "/metrics",
                axum::routing::get(|| async {
                    (
                        [(axum::http::header::CONTENT_TYPE, "text/plain")],
                        "foo 1",
                    )
                }),
            )
            .route(
                "/broken",
                axum::routing::get(|| async {
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn fetch_returns_body_and_content_type() {
        let addr = serve_stub().await;
        let context = PathContext::new(0, "metrics".into(), format!("http://{addr}/metrics"));
        let client = reqwest::Client::new();

        let response = context.fetch(&client, "agt_test", 1).await;
        assert!(response.valid);
        assert_eq!(response.status_code, 200);
        assert_eq!(response.text, "foo 1");
        assert_eq!(response.content_type, "text/plain");
    }

    #[tokio::test]
    async fn fetch_passes_through_error_status_as_invalid() {
        let addr = serve_stub().await;
        let context = PathContext::new(0, "broken".into(), format!("http://{addr}/broken"));
        let client = reqwest::Client::new();

        let response = context.fetch(&client, "agt_test", 2).await;
        assert!(!response.valid);
        assert_eq!(response.status_code, 500);
        assert!(response.text.is_empty());
    }

    #[tokio::test]
    async fn fetch_maps_io_failure_to_invalid_404() {
        // Nothing listens here.
        let context = PathContext::new(0, "gone".into(), "http://127.0.0.1:1/metrics".into());
        let client = reqwest::Client::new();

        let response = context.fetch(&client, "agt_test", 3).await;
        assert!(!response.valid);
        assert_eq!(response.status_code, 404);
    }

    #[tokio::test]
    async fn workers_synthesize_invalid_response_for_unknown_path() {
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let (response_tx, mut response_rx) = mpsc::channel(4);
        let backlog = Arc::new(AtomicUsize::new(0));

        spawn_workers(
            2,
            reqwest::Client::new(),
            Arc::new(HashMap::new()),
            "agt_test".into(),
            inbound_rx,
            response_tx,
            backlog,
        );

        inbound_tx
            .send(ScrapeRequestPayload {
                agent_id: "agt_test".into(),
                scrape_id: 9,
                path: "never_registered".into(),
                accept: None,
            })
            .await
            .unwrap();

        let response = response_rx.recv().await.unwrap();
        assert_eq!(response.scrape_id, 9);
        assert!(!response.valid);
        assert_eq!(response.status_code, 404);
    }
}
