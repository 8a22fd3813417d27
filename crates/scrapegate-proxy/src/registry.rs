//! Proxy-wide registry of agents, routable paths, and in-flight scrapes.
//!
//! The registry owns the three concurrent indices every scrape touches:
//!
//! - `agents_by_id` — agent id → [`AgentConnection`]
//! - `path_to_agent` — scrape path → agent id
//! - `requests_by_id` — scrape id → [`ScrapeContext`]
//!
//! All lifecycle transitions (connect, disconnect, path registration) go
//! through registry operations; nothing else mutates these maps. Disconnect
//! removes path entries before the agent entry, so a routing read never sees
//! a path pointing at an agent that was torn down before the path was.
//!
//! Path conflict policy: last registration wins. Re-registering a path moves
//! the route to the new agent and drops it from the previous owner's set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};

use scrapegate_common::ids::{self, ScrapeIdGenerator};
use scrapegate_common::protocol::{ScrapeRequestPayload, ScrapeResponsePayload};

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown or invalid agent id: {0}")]
    AgentNotFound(String),

    #[error("outbound queue full for agent {0}")]
    QueueFull(String),
}

// ── AgentConnection ─────────────────────────────────────────────────

/// Proxy-side state for one connected agent.
///
/// Created by [`Registry::connect`], owned by the registry for its whole
/// lifetime. The WebSocket bridge only reads from it: it takes the outbound
/// queue receiver once and drains it for the life of the connection.
pub struct AgentConnection {
    agent_id: String,
    remote_addr: String,
    hostname: Mutex<Option<String>>,
    /// True from connect until disconnect/teardown.
    valid: AtomicBool,
    outbound_tx: mpsc::Sender<ScrapeRequestPayload>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ScrapeRequestPayload>>>,
    paths: Mutex<HashSet<String>>,
}

impl AgentConnection {
    fn new(agent_id: String, remote_addr: String, queue_capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
        Self {
            agent_id,
            remote_addr,
            hostname: Mutex::new(None),
            valid: AtomicBool::new(true),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            paths: Mutex::new(HashSet::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn hostname(&self) -> Option<String> {
        self.hostname.lock().unwrap().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn set_hostname(&self, hostname: &str) {
        *self.hostname.lock().unwrap() = Some(hostname.to_string());
    }

    fn add_path(&self, path: &str) {
        self.paths.lock().unwrap().insert(path.to_string());
    }

    fn remove_path(&self, path: &str) {
        self.paths.lock().unwrap().remove(path);
    }

    /// Registered paths, for introspection.
    pub fn registered_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.paths.lock().unwrap().iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of requests sitting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.outbound_tx.max_capacity() - self.outbound_tx.capacity()
    }

    /// Take the outbound queue receiver. Yields `Some` exactly once, for the
    /// WebSocket bridge task that streams requests down to the agent.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<ScrapeRequestPayload>> {
        self.outbound_rx.lock().unwrap().take()
    }
}

// ── ScrapeContext ───────────────────────────────────────────────────

/// Correlation state for one in-flight scrape, from enqueue to resolution
/// or abandonment.
///
/// The response slot is single-assignment and the completion signal fires at
/// most once; a waiter can never observe a partially written response. The
/// HTTP handler that created the context removes it from the registry on
/// every exit path.
pub struct ScrapeContext {
    scrape_id: u64,
    agent_id: String,
    path: String,
    accept: Option<String>,
    created_at: Instant,
    response: OnceLock<ScrapeResponsePayload>,
    complete: Notify,
}

impl ScrapeContext {
    fn new(scrape_id: u64, agent_id: String, path: String, accept: Option<String>) -> Self {
        Self {
            scrape_id,
            agent_id,
            path,
            accept,
            created_at: Instant::now(),
            response: OnceLock::new(),
            complete: Notify::new(),
        }
    }

    pub fn scrape_id(&self) -> u64 {
        self.scrape_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// The wire payload sent down to the agent.
    pub fn request_payload(&self) -> ScrapeRequestPayload {
        ScrapeRequestPayload {
            agent_id: self.agent_id.clone(),
            scrape_id: self.scrape_id,
            path: self.path.clone(),
            accept: self.accept.clone(),
        }
    }

    /// Write the response slot and fire the completion signal. Returns false
    /// if the slot was already written (the duplicate is discarded).
    fn resolve(&self, response: ScrapeResponsePayload) -> bool {
        if self.response.set(response).is_ok() {
            self.complete.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn response(&self) -> Option<&ScrapeResponsePayload> {
        self.response.get()
    }

    /// Wait up to `timeout` for the completion signal. Returns true once the
    /// response slot is written. Interest in the signal is registered before
    /// the slot check, so a resolve landing between check and await is not
    /// lost.
    pub async fn wait_complete(&self, timeout: Duration) -> bool {
        let notified = self.complete.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.response.get().is_some() {
            return true;
        }

        match tokio::time::timeout(timeout, notified).await {
            Ok(()) => true,
            Err(_) => self.response.get().is_some(),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// The proxy's concurrent indices and lifecycle operations.
pub struct Registry {
    queue_capacity: usize,
    scrape_ids: ScrapeIdGenerator,
    path_ids: AtomicU64,
    agents_by_id: DashMap<String, Arc<AgentConnection>>,
    path_to_agent: DashMap<String, String>,
    requests_by_id: DashMap<u64, Arc<ScrapeContext>>,
}

impl Registry {
    /// `queue_capacity` bounds each agent's outbound request queue.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            scrape_ids: ScrapeIdGenerator::new(),
            path_ids: AtomicU64::new(0),
            agents_by_id: DashMap::new(),
            path_to_agent: DashMap::new(),
            requests_by_id: DashMap::new(),
        }
    }

    /// Register a new agent connection. Allocates a fresh agent id; never
    /// fails.
    pub fn connect(&self, remote_addr: &str) -> Arc<AgentConnection> {
        let agent_id = ids::agent_id();
        let conn = Arc::new(AgentConnection::new(
            agent_id.clone(),
            remote_addr.to_string(),
            self.queue_capacity,
        ));
        self.agents_by_id.insert(agent_id.clone(), conn.clone());
        tracing::info!(agent_id = %agent_id, remote_addr, "agent connected");
        conn
    }

    /// Tear down an agent: invalidate it, purge its path registrations, drop
    /// it from the index. Idempotent — disconnecting an unknown id is logged
    /// as an anomaly and otherwise a no-op.
    ///
    /// In-flight scrapes for this agent are not cancelled here; their
    /// waiters notice the invalid agent on the next poll wake.
    pub fn disconnect(&self, agent_id: &str) {
        let conn = match self.agents_by_id.get(agent_id) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::warn!(agent_id, "disconnect for unknown agent id");
                return;
            }
        };

        conn.invalidate();
        // Path entries must go before the agent entry so routing never sees
        // a path pointing at a missing agent.
        self.path_to_agent.retain(|_, owner| owner != agent_id);
        self.agents_by_id.remove(agent_id);
        tracing::info!(
            agent_id,
            remote_addr = %conn.remote_addr(),
            "agent disconnected"
        );
    }

    /// Record the agent's hostname. Fails if the agent id is unknown or the
    /// connection has been invalidated.
    pub fn register_agent(&self, agent_id: &str, hostname: &str) -> Result<(), RegistryError> {
        let conn = self.live_agent(agent_id)?;
        conn.set_hostname(hostname);
        tracing::info!(agent_id, hostname, "agent registered");
        Ok(())
    }

    /// Claim `path` for `agent_id`, returning a proxy-scoped path id.
    /// Last registration wins: a path already owned by another live agent is
    /// moved to the new registrant.
    pub fn register_path(&self, agent_id: &str, path: &str) -> Result<u64, RegistryError> {
        let conn = self.live_agent(agent_id)?;
        let path = path.trim_start_matches('/').to_string();
        let path_id = self.path_ids.fetch_add(1, Ordering::Relaxed);

        if let Some((_, previous)) = self.path_to_agent.remove(&path) {
            if previous != agent_id {
                tracing::info!(
                    path,
                    old_agent = %previous,
                    new_agent = %agent_id,
                    "path re-registered, last registration wins"
                );
                if let Some(old) = self.agents_by_id.get(&previous) {
                    old.remove_path(&path);
                }
            }
        }
        self.path_to_agent.insert(path.clone(), agent_id.to_string());
        conn.add_path(&path);
        tracing::info!(path, agent_id, path_id, "path registered");
        Ok(path_id)
    }

    /// Resolve a path to its owning agent id.
    pub fn route_by_path(&self, path: &str) -> Option<String> {
        self.path_to_agent.get(path).map(|entry| entry.clone())
    }

    /// True while the agent is connected and not torn down.
    pub fn is_valid_agent(&self, agent_id: &str) -> bool {
        self.agents_by_id
            .get(agent_id)
            .map(|conn| conn.is_valid())
            .unwrap_or(false)
    }

    /// Build a fresh scrape context with the next scrape id. The context is
    /// not indexed or queued until [`Registry::enqueue`].
    pub fn new_scrape(
        &self,
        agent_id: &str,
        path: &str,
        accept: Option<String>,
    ) -> Arc<ScrapeContext> {
        Arc::new(ScrapeContext::new(
            self.scrape_ids.next_id(),
            agent_id.to_string(),
            path.to_string(),
            accept,
        ))
    }

    /// Index the scrape and place it on the owning agent's outbound queue.
    /// `QueueFull` signals backpressure; the caller surfaces it as a 503.
    pub fn enqueue(&self, ctx: &Arc<ScrapeContext>) -> Result<(), RegistryError> {
        let conn = self.live_agent(ctx.agent_id())?;
        self.requests_by_id.insert(ctx.scrape_id(), ctx.clone());

        if let Err(err) = conn.outbound_tx.try_send(ctx.request_payload()) {
            self.requests_by_id.remove(&ctx.scrape_id());
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => {
                    RegistryError::QueueFull(ctx.agent_id().to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    RegistryError::AgentNotFound(ctx.agent_id().to_string())
                }
            });
        }
        Ok(())
    }

    /// Deliver an agent response to the matching scrape context. A missing
    /// scrape id means the waiter already gave up and removed the context;
    /// the response is discarded, which is expected rather than an error.
    pub fn resolve(&self, scrape_id: u64, response: ScrapeResponsePayload) {
        match self.requests_by_id.get(&scrape_id) {
            Some(ctx) => {
                if !ctx.resolve(response) {
                    tracing::debug!(scrape_id, "duplicate response discarded");
                }
            }
            None => {
                tracing::debug!(scrape_id, "late response for abandoned scrape discarded");
            }
        }
    }

    /// Remove and return the scrape context. Called by the waiter on every
    /// exit path so abandoned scrapes never leak.
    pub fn remove(&self, scrape_id: u64) -> Option<Arc<ScrapeContext>> {
        self.requests_by_id.remove(&scrape_id).map(|(_, ctx)| ctx)
    }

    /// Snapshot of connected agents, for introspection.
    pub fn agents(&self) -> Vec<Arc<AgentConnection>> {
        self.agents_by_id
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of scrapes currently indexed.
    pub fn pending_scrapes(&self) -> usize {
        self.requests_by_id.len()
    }

    fn live_agent(&self, agent_id: &str) -> Result<Arc<AgentConnection>, RegistryError> {
        self.agents_by_id
            .get(agent_id)
            .filter(|conn| conn.is_valid())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))
    }
}
