//! Controllers for telemetry pipelines
//! This module contains the per-signal pipeline controllers, the
//! Telemetry controller, and the building blocks they share: validation,
//! configuration rendering, workload management and status synthesis.

pub mod conditions;
pub mod config;
pub mod messages;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod overrides;
pub mod prober;
mod reconciler;
pub mod resources;
pub mod secrets;
pub mod self_monitor;
pub mod status;
mod telemetry_reconciler;
pub mod tls;
pub mod validation;

pub use reconciler::{
    calculate_backoff, load_telemetry, run_pipeline_controller, ControllerState, OperatorConfig,
    SignalPipeline, DEFAULT_COLLECTOR_IMAGE, DEFAULT_LOG_AGENT_IMAGE, DEFAULT_MAX_PIPELINES,
    DEFAULT_RECONCILE_TIMEOUT,
};
pub use self_monitor::SelfMonitorClient;
pub use telemetry_reconciler::{run_telemetry_controller, TELEMETRY_FINALIZER};
