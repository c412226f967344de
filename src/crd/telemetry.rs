//! Telemetry Custom Resource Definition
//!
//! A single cluster-scoped Telemetry resource holds cluster-wide overrides
//! (enrichments, gateway scaling) and reports the aggregate health of all
//! signals.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, Signal};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "telemetry.kube-ops.io",
    version = "v1alpha1",
    kind = "Telemetry",
    plural = "telemetries",
    status = "TelemetryStatus",
    shortname = "tel",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichments: Option<EnrichmentSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<SignalSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<SignalSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<SignalSpec>,
}

impl TelemetrySpec {
    pub fn signal(&self, signal: Signal) -> Option<&SignalSpec> {
        match signal {
            Signal::Logs => self.log.as_ref(),
            Signal::Metrics => self.metric.as_ref(),
            Signal::Traces => self.trace.as_ref(),
        }
    }

    /// Statically configured gateway replicas for a signal
    pub fn static_gateway_replicas(&self, signal: Signal) -> Option<i32> {
        let scaling = &self.signal(signal)?.gateway.scaling;
        match scaling.type_ {
            ScalingStrategy::Static => scaling
                .static_
                .as_ref()
                .map(|s| s.replicas)
                .filter(|r| *r > 0),
        }
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.enrichments
            .as_ref()
            .and_then(|e| e.cluster.as_ref())
            .map(|c| c.name.as_str())
            .filter(|n| !n.is_empty())
    }

    pub fn pod_label_rules(&self) -> &[PodLabel] {
        self.enrichments
            .as_ref()
            .map(|e| e.extract_pod_labels.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract_pod_labels: Vec<PodLabel>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub name: String,
}

/// Pod label to copy onto telemetry, by exact key or key prefix
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodLabel {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_prefix: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignalSpec {
    #[serde(default)]
    pub gateway: GatewaySpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[serde(default)]
    pub scaling: Scaling,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Scaling {
    #[serde(rename = "type", default)]
    pub type_: ScalingStrategy,

    #[serde(rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_: Option<StaticScaling>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ScalingStrategy {
    #[default]
    Static,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaticScaling {
    pub replicas: i32,
}

/// Aggregate state of the Telemetry resource
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TelemetryState {
    #[default]
    Ready,
    Warning,
    Deleting,
}

impl fmt::Display for TelemetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryState::Ready => write!(f, "Ready"),
            TelemetryState::Warning => write!(f, "Warning"),
            TelemetryState::Deleting => write!(f, "Deleting"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStatus {
    #[serde(default)]
    pub state: TelemetryState,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub endpoints: GatewayEndpoints,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEndpoints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<OtlpEndpoints>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<OtlpEndpoints>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub traces: Option<OtlpEndpoints>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtlpEndpoints {
    pub grpc: String,
    pub http: String,
}
