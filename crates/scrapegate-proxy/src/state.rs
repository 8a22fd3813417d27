//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::registry::Registry;

/// Tunables for the proxy, set from the CLI in `main` and from test
/// harnesses directly.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Per-agent outbound queue capacity.
    pub queue_capacity: usize,
    /// How long a scrape may stay unanswered before the caller gets a 503.
    pub scrape_timeout: Duration,
    /// Bound on each wait iteration; guard conditions are re-checked on
    /// every wake.
    pub poll_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            scrape_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProxyConfig,
    registry: Registry,
    /// Flips to true when the proxy begins shutting down; waiting scrape
    /// handlers observe it and bail out with a 503.
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(config: ProxyConfig, shutdown: watch::Receiver<bool>) -> Self {
        let registry = Registry::new(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }
}
