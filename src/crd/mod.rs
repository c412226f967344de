//! Custom Resource Definitions for telemetry pipelines
//!
//! This module defines the three pipeline kinds (one per signal), the
//! cluster-wide Telemetry resource, and the types they share.

mod log_pipeline;
mod metric_pipeline;
pub mod pipeline;
mod telemetry;
mod trace_pipeline;
pub mod types;

#[cfg(test)]
mod tests;

pub use log_pipeline::{
    ApplicationInput, HttpOutput, HttpTls, InputContainers, InputNamespaces, LogFilter, LogInput,
    LogOutput, LogPipeline, LogPipelineSpec, LogPipelineStatus,
};
pub use metric_pipeline::{
    MetricInput, MetricOutput, MetricPipeline, MetricPipelineSpec, MetricPipelineStatus,
    MetricSource, MetricSourceInput,
};
pub use pipeline::{creation_order_key, TelemetryPipeline};
pub use telemetry::{
    ClusterInfo, EnrichmentSpec, GatewayEndpoints, GatewaySpec, OtlpEndpoints, PodLabel, Scaling,
    ScalingStrategy, SignalSpec, StaticScaling, Telemetry, TelemetrySpec, TelemetryState,
    TelemetryStatus,
};
pub use trace_pipeline::{TraceOutput, TracePipeline, TracePipelineSpec, TracePipelineStatus};
pub use types::*;
