//! Shared types for the scrapegate platform.
//!
//! This crate contains:
//! - **Protocol messages** — WebSocket message types between agent and proxy
//! - **ID generation** — Prefixed UUIDv7 helpers (`agt_`) and the monotonic
//!   scrape-id counter

pub mod ids;
pub mod protocol;
