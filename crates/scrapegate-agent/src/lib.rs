//! Scrapegate agent library.
//!
//! The binary is a thin CLI wrapper; the connection loop, fetch worker
//! pool, and target config loading live here so integration tests can
//! drive them directly.

pub mod config;
pub mod control;
pub mod fetch;
