//! Scrapegate proxy library.
//!
//! Re-exports the registry, shared state, and HTTP handlers so they can be
//! used by integration tests (and potentially embedded in other binaries).

pub mod debug;
pub mod registry;
pub mod scrape;
pub mod state;
pub mod ws_agent;
