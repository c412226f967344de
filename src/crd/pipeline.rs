//! Signal-independent view of the three pipeline kinds
//!
//! The controllers are generic over [`TelemetryPipeline`], so the
//! reconcile loop, validation and status synthesis are written once.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use k8s_openapi::ClusterResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use super::log_pipeline::LogPipeline;
use super::metric_pipeline::MetricPipeline;
use super::trace_pipeline::TracePipeline;
use super::types::{Condition, OtlpOutput, SecretKeyRef, Signal, TlsMaterial, ValueType};

pub trait TelemetryPipeline:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const SIGNAL: Signal;

    /// Conditions currently stored in the status subresource
    fn conditions(&self) -> &[Condition];

    /// Whether this pipeline is served by the signal's gateway
    fn requires_gateway(&self) -> bool;

    /// Whether this pipeline needs the per-node agent
    fn requires_agent(&self) -> bool;

    /// Every value of the pipeline that may reference a Secret
    fn values(&self) -> Vec<&ValueType>;

    fn tls_material(&self) -> TlsMaterial<'_>;

    /// OTLP output, when the pipeline exports over OTLP
    fn otlp_output(&self) -> Option<&OtlpOutput>;

    /// Number of output plugins configured; exactly one is valid
    fn output_count(&self) -> usize {
        1
    }

    /// Pipelines relying on unsupported custom fragments
    fn unsupported_mode(&self) -> bool {
        false
    }

    /// Whether the stored status already reflects every field besides
    /// the conditions
    fn status_extras_current(&self) -> bool {
        true
    }

    /// Status body written to the status subresource
    fn status_patch(&self, conditions: &[Condition]) -> serde_json::Value {
        json!({ "conditions": conditions })
    }

    fn secret_refs(&self) -> Vec<&SecretKeyRef> {
        let mut refs: Vec<&SecretKeyRef> = self
            .values()
            .into_iter()
            .filter_map(|v| v.secret_ref())
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    fn references_secret(&self, name: &str, namespace: &str) -> bool {
        self.secret_refs()
            .iter()
            .any(|r| r.name == name && r.namespace == namespace)
    }

    fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn generation(&self) -> Option<i64> {
        self.meta().generation
    }
}

impl TelemetryPipeline for TracePipeline {
    const SIGNAL: Signal = Signal::Traces;

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn requires_gateway(&self) -> bool {
        true
    }

    fn requires_agent(&self) -> bool {
        false
    }

    fn values(&self) -> Vec<&ValueType> {
        self.spec.output.otlp.values()
    }

    fn tls_material(&self) -> TlsMaterial<'_> {
        self.spec
            .output
            .otlp
            .tls
            .as_ref()
            .map(|t| t.material())
            .unwrap_or_default()
    }

    fn otlp_output(&self) -> Option<&OtlpOutput> {
        Some(&self.spec.output.otlp)
    }
}

impl TelemetryPipeline for MetricPipeline {
    const SIGNAL: Signal = Signal::Metrics;

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn requires_gateway(&self) -> bool {
        true
    }

    fn requires_agent(&self) -> bool {
        self.spec.requires_agent()
    }

    fn values(&self) -> Vec<&ValueType> {
        self.spec.output.otlp.values()
    }

    fn tls_material(&self) -> TlsMaterial<'_> {
        self.spec
            .output
            .otlp
            .tls
            .as_ref()
            .map(|t| t.material())
            .unwrap_or_default()
    }

    fn otlp_output(&self) -> Option<&OtlpOutput> {
        Some(&self.spec.output.otlp)
    }
}

impl TelemetryPipeline for LogPipeline {
    const SIGNAL: Signal = Signal::Logs;

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn requires_gateway(&self) -> bool {
        self.spec.output.is_otlp_defined()
    }

    fn requires_agent(&self) -> bool {
        !self.spec.output.is_otlp_defined() && self.spec.application_input_enabled()
    }

    fn values(&self) -> Vec<&ValueType> {
        let output = &self.spec.output;
        if let Some(otlp) = &output.otlp {
            return otlp.values();
        }
        if let Some(http) = &output.http {
            return http.values();
        }
        Vec::new()
    }

    fn tls_material(&self) -> TlsMaterial<'_> {
        self.spec.tls_material()
    }

    fn otlp_output(&self) -> Option<&OtlpOutput> {
        self.spec.output.otlp.as_ref()
    }

    fn output_count(&self) -> usize {
        self.spec.output.defined_count()
    }

    fn unsupported_mode(&self) -> bool {
        self.spec.contains_custom_plugin()
    }

    fn status_extras_current(&self) -> bool {
        self.status.as_ref().and_then(|s| s.unsupported_mode) == Some(self.unsupported_mode())
    }

    fn status_patch(&self, conditions: &[Condition]) -> serde_json::Value {
        json!({
            "conditions": conditions,
            "unsupportedMode": self.unsupported_mode(),
        })
    }
}

/// Sort key used wherever pipelines compete for a limited resource:
/// oldest first, ties broken by name.
pub fn creation_order_key<P: TelemetryPipeline>(
    pipeline: &P,
) -> (Option<DateTime<Utc>>, String) {
    let created = pipeline.meta().creation_timestamp.as_ref().map(|t| t.0);
    (created, pipeline.name_any())
}
