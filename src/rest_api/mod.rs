//! REST API module for external integrations
//!
//! Serves the operator's probes and metrics, plus a read-only view of
//! the pipelines and their health.

mod dto;
mod handlers;
mod server;

pub use server::run_server;
