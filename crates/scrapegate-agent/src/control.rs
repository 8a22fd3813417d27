//! WebSocket connection to the proxy.
//!
//! Handles:
//! - Connect + register handshake, run under a deadline (the proxy assigns
//!   the agent id)
//! - Path registration for every configured target
//! - The streaming phase: scrape requests in, fetch responses out
//! - Heartbeat after prolonged write inactivity
//! - Reconnect at a steady cadence on any failure
//!
//! Each connection attempt rebuilds all per-attempt state: the assigned
//! agent id, the path table, the fetch worker pool, and both local queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use scrapegate_common::protocol::{
    ConnectPayload, ConnectResponsePayload, Envelope, HeartbeatPayload, RegisterAgentPayload,
    RegisterAgentResponsePayload, RegisterPathPayload, RegisterPathResponsePayload,
    ScrapeRequestPayload, ScrapeResponsePayload,
};

use crate::config::TargetEntry;
use crate::fetch::{self, PathContext};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Inbound scrape requests waiting for a fetch worker.
const FETCH_QUEUE_CAPACITY: usize = 64;
/// Completed fetches waiting to be written upstream.
const RESPONSE_QUEUE_CAPACITY: usize = 256;

/// Settings for the connection loop, fixed at startup.
#[derive(Debug)]
pub struct AgentConfig {
    pub proxy_url: String,
    pub hostname: String,
    pub targets: Vec<TargetEntry>,
    /// Minimum spacing between connection attempts.
    pub reconnect_pause: Duration,
    /// Bound on the whole connect/register phase of one attempt.
    pub handshake_timeout: Duration,
    /// Size of the fetch worker pool.
    pub fetch_workers: usize,
    /// How often write inactivity is checked.
    pub heartbeat_check: Duration,
    /// Inactivity span after which a heartbeat is sent.
    pub max_inactivity: Duration,
}

impl AgentConfig {
    pub fn new(proxy_url: String, hostname: String, targets: Vec<TargetEntry>) -> Self {
        Self {
            proxy_url,
            hostname,
            targets,
            reconnect_pause: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
            fetch_workers: 4,
            heartbeat_check: Duration::from_secs(5),
            max_inactivity: Duration::from_secs(30),
        }
    }
}

/// Run the connection loop until shutdown. Attempts are paced at one per
/// `reconnect_pause` — a failed attempt never retries faster than that.
pub async fn run(config: Arc<AgentConfig>, mut shutdown: watch::Receiver<bool>) {
    let client = reqwest::Client::new();

    loop {
        let attempt_started = Instant::now();
        tracing::info!(url = %config.proxy_url, "connecting to proxy");

        match connect_and_run(&config, &client, &mut shutdown).await {
            Ok(()) => tracing::info!("connection closed"),
            Err(err) => tracing::warn!(error = %err, "connection attempt failed"),
        }

        if *shutdown.borrow() {
            return;
        }

        let elapsed = attempt_started.elapsed();
        if elapsed < config.reconnect_pause {
            let wait = config.reconnect_pause - elapsed;
            tracing::info!(wait_ms = wait.as_millis() as u64, "waiting to reconnect");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Everything the streaming phase needs, produced by the handshake.
struct HandshakeOutcome {
    ws_tx: WsSink,
    ws_rx: WsStream,
    agent_id: String,
    paths: HashMap<String, PathContext>,
    early_requests: Vec<ScrapeRequestPayload>,
}

/// One connection attempt: handshake, registration, then the streaming
/// loop. Any error unwinds the whole attempt back to the reconnect pacing.
async fn connect_and_run(
    config: &AgentConfig,
    client: &reqwest::Client,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // The whole connect/register phase runs under one deadline; a proxy
    // that accepts the socket but never answers cannot wedge the attempt.
    let outcome = match tokio::time::timeout(config.handshake_timeout, handshake(config)).await {
        Ok(outcome) => outcome?,
        Err(_) => anyhow::bail!(
            "handshake timed out after {}ms",
            config.handshake_timeout.as_millis()
        ),
    };
    let HandshakeOutcome {
        mut ws_tx,
        mut ws_rx,
        agent_id,
        paths,
        mut early_requests,
    } = outcome;

    // ── Streaming ───────────────────────────────────────────────
    let (inbound_tx, inbound_rx) = mpsc::channel(FETCH_QUEUE_CAPACITY);
    let (response_tx, mut response_rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
    let backlog = Arc::new(AtomicUsize::new(0));

    fetch::spawn_workers(
        config.fetch_workers,
        client.clone(),
        Arc::new(paths),
        agent_id.clone(),
        inbound_rx,
        response_tx.clone(),
        backlog.clone(),
    );

    for request in early_requests.drain(..) {
        dispatch(&inbound_tx, &response_tx, &agent_id, request);
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_check);
    let mut last_sent = Instant::now();

    loop {
        tokio::select! {
            // Scrape requests from the proxy
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_proxy_message(&text, &inbound_tx, &response_tx, &agent_id);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("proxy closed connection");
                        break;
                    }
                    Some(Err(err)) => {
                        anyhow::bail!("WebSocket read error: {err}");
                    }
                    _ => {} // Ping/Pong handled by tungstenite
                }
            }

            // Completed fetches, written upstream in completion order
            response = response_rx.recv() => {
                if let Some(payload) = response {
                    send_envelope(&mut ws_tx, "scrape.response", &payload).await?;
                    last_sent = Instant::now();
                }
            }

            // Keep-alive after prolonged write inactivity
            _ = heartbeat.tick() => {
                if last_sent.elapsed() > config.max_inactivity {
                    tracing::debug!("sending heartbeat");
                    send_envelope(&mut ws_tx, "agent.heartbeat", &HeartbeatPayload {
                        agent_id: agent_id.clone(),
                        backlog: backlog.load(Ordering::Relaxed),
                    }).await?;
                    last_sent = Instant::now();
                }
            }

            // Shutdown signal
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("shutdown signal received, closing WebSocket");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Connect and work through the registration sequence. Runs under the
/// caller's `handshake_timeout` deadline, so every await here is bounded.
async fn handshake(config: &AgentConfig) -> anyhow::Result<HandshakeOutcome> {
    let (ws, _response) = tokio_tungstenite::connect_async(&config.proxy_url).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Scrape requests can start flowing as soon as the first path is
    // registered; anything that arrives mid-handshake is buffered here.
    let mut early_requests: Vec<ScrapeRequestPayload> = Vec::new();

    // ── Connect: the proxy assigns our identity ─────────────────
    send_envelope(
        &mut ws_tx,
        "agent.connect",
        &ConnectPayload {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )
    .await?;

    let envelope =
        await_envelope(&mut ws_rx, "agent.connect.response", &mut early_requests).await?;
    let connect_response: ConnectResponsePayload = envelope.parse_payload()?;
    let agent_id = connect_response.agent_id;
    tracing::info!(agent_id = %agent_id, "connected, assigned agent id");

    // ── Register ────────────────────────────────────────────────
    send_envelope(
        &mut ws_tx,
        "agent.register",
        &RegisterAgentPayload {
            agent_id: agent_id.clone(),
            hostname: config.hostname.clone(),
        },
    )
    .await?;

    let envelope =
        await_envelope(&mut ws_rx, "agent.register.response", &mut early_requests).await?;
    let register_response: RegisterAgentResponsePayload = envelope.parse_payload()?;
    if !register_response.valid {
        anyhow::bail!(
            "agent registration rejected: {}",
            register_response.reason.unwrap_or_default()
        );
    }

    // ── Register paths ──────────────────────────────────────────
    let mut paths: HashMap<String, PathContext> = HashMap::new();
    for target in &config.targets {
        send_envelope(
            &mut ws_tx,
            "path.register",
            &RegisterPathPayload {
                agent_id: agent_id.clone(),
                path: target.path.clone(),
            },
        )
        .await?;

        let envelope =
            await_envelope(&mut ws_rx, "path.register.response", &mut early_requests).await?;
        let path_response: RegisterPathResponsePayload = envelope.parse_payload()?;
        if !path_response.valid {
            anyhow::bail!(
                "path registration rejected for /{}: {}",
                target.path,
                path_response.reason.unwrap_or_default()
            );
        }

        tracing::info!(
            path = %target.path,
            url = %target.url,
            path_id = path_response.path_id,
            "registered path"
        );
        paths.insert(
            target.path.clone(),
            PathContext::new(path_response.path_id, target.path.clone(), target.url.clone()),
        );
    }

    Ok(HandshakeOutcome {
        ws_tx,
        ws_rx,
        agent_id,
        paths,
        early_requests,
    })
}

/// Handle one message from the proxy during the streaming phase.
fn handle_proxy_message(
    raw: &str,
    inbound_tx: &mpsc::Sender<ScrapeRequestPayload>,
    response_tx: &mpsc::Sender<ScrapeResponsePayload>,
    agent_id: &str,
) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!("invalid message from proxy: {err}");
            return;
        }
    };

    match envelope.msg_type.as_str() {
        "scrape.request" => match envelope.parse_payload::<ScrapeRequestPayload>() {
            Ok(request) => dispatch(inbound_tx, response_tx, agent_id, request),
            Err(err) => tracing::warn!("bad scrape.request payload: {err}"),
        },
        other => {
            tracing::debug!(msg_type = %other, "unhandled proxy message type");
        }
    }
}

/// Hand a scrape request to the worker pool. A full fetch queue rejects the
/// scrape with a synthesized 503 instead of stalling the socket loop; if
/// even the response queue is full the request is dropped and the proxy
/// side times out on its own.
fn dispatch(
    inbound_tx: &mpsc::Sender<ScrapeRequestPayload>,
    response_tx: &mpsc::Sender<ScrapeResponsePayload>,
    agent_id: &str,
    request: ScrapeRequestPayload,
) {
    if let Err(err) = inbound_tx.try_send(request) {
        let request = err.into_inner();
        tracing::warn!(
            scrape_id = request.scrape_id,
            path = %request.path,
            "fetch queue full, rejecting scrape"
        );
        let response = fetch::invalid_response(agent_id, request.scrape_id, 503);
        if response_tx.try_send(response).is_err() {
            tracing::warn!(scrape_id = request.scrape_id, "response queue full, dropping scrape");
        }
    }
}

async fn send_envelope(
    ws_tx: &mut WsSink,
    msg_type: &str,
    payload: &impl serde::Serialize,
) -> anyhow::Result<()> {
    let envelope = Envelope::new(msg_type, payload);
    let json = serde_json::to_string(&envelope)?;
    ws_tx.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Read frames until an envelope of `expected` type arrives. Scrape
/// requests that interleave with handshake replies are buffered for the
/// streaming phase rather than dropped.
async fn await_envelope(
    ws_rx: &mut WsStream,
    expected: &str,
    early_requests: &mut Vec<ScrapeRequestPayload>,
) -> anyhow::Result<Envelope> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope: Envelope = serde_json::from_str(&text)?;
                if envelope.msg_type == expected {
                    return Ok(envelope);
                }
                if envelope.msg_type == "scrape.request" {
                    if let Ok(request) = envelope.parse_payload::<ScrapeRequestPayload>() {
                        early_requests.push(request);
                    }
                    continue;
                }
                tracing::debug!(
                    msg_type = %envelope.msg_type,
                    expected,
                    "unexpected message during handshake"
                );
            }
            Some(Ok(Message::Close(_))) | None => {
                anyhow::bail!("connection closed while waiting for {expected}");
            }
            Some(Err(err)) => anyhow::bail!("WebSocket error while waiting for {expected}: {err}"),
            _ => {} // Ping/Pong
        }
    }
}
