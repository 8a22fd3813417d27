//! ID generation.
//!
//! Agent IDs use an `agt_` prefix followed by a UUIDv7 (time-ordered), so
//! they are globally unique, sortable by creation time, and recognizable in
//! logs. Scrape IDs come from a [`ScrapeIdGenerator`] owned by the proxy's
//! registry — a plain monotonic counter, never a process-wide static, so
//! every test can start from a fresh generator.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate an agent ID: `agt_<uuid7>`
pub fn agent_id() -> String {
    prefixed_id("agt")
}

/// Monotonic scrape-id source.
///
/// Strictly increasing across concurrent callers; one instance per registry.
#[derive(Debug, Default)]
pub struct ScrapeIdGenerator {
    next: AtomicU64,
}

impl ScrapeIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next scrape id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
