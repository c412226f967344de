//! MetricPipeline Custom Resource Definition
//!
//! Metric pipelines always ship through the metric gateway. Enabling the
//! runtime, prometheus or istio input additionally requires the per-node
//! metric agent.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, NamespaceSelector, OtlpInput, OtlpOutput};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "telemetry.kube-ops.io",
    version = "v1alpha1",
    kind = "MetricPipeline",
    status = "MetricPipelineStatus",
    shortname = "mp",
    printcolumn = r#"{"name":"Configuration Generated","type":"string","jsonPath":".status.conditions[?(@.type=='ConfigurationGenerated')].status"}"#,
    printcolumn = r#"{"name":"Gateway Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='GatewayHealthy')].status"}"#,
    printcolumn = r#"{"name":"Agent Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='AgentHealthy')].status"}"#,
    printcolumn = r#"{"name":"Flow Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='TelemetryFlowHealthy')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetricPipelineSpec {
    #[serde(default)]
    pub input: MetricInput,

    pub output: MetricOutput,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricInput {
    /// Kubelet resource metrics of pods and containers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<MetricSourceInput>,

    /// Scrape annotated workloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<MetricSourceInput>,

    /// Scrape Istio sidecar proxies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub istio: Option<MetricSourceInput>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpInput>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricSourceInput {
    #[serde(default)]
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricOutput {
    pub otlp: OtlpOutput,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricPipelineStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Node-local metric sources collected by the agent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricSource {
    Runtime,
    Prometheus,
    Istio,
}

impl MetricSource {
    pub const ALL: [MetricSource; 3] = [
        MetricSource::Runtime,
        MetricSource::Prometheus,
        MetricSource::Istio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricSource::Runtime => "runtime",
            MetricSource::Prometheus => "prometheus",
            MetricSource::Istio => "istio",
        }
    }
}

impl MetricInput {
    pub fn source(&self, source: MetricSource) -> Option<&MetricSourceInput> {
        match source {
            MetricSource::Runtime => self.runtime.as_ref(),
            MetricSource::Prometheus => self.prometheus.as_ref(),
            MetricSource::Istio => self.istio.as_ref(),
        }
    }

    pub fn is_enabled(&self, source: MetricSource) -> bool {
        self.source(source).map(|s| s.enabled).unwrap_or(false)
    }

    pub fn otlp_enabled(&self) -> bool {
        self.otlp.as_ref().map(|o| !o.disabled).unwrap_or(true)
    }
}

impl MetricPipelineSpec {
    /// Any node-local source needs the agent
    pub fn requires_agent(&self) -> bool {
        MetricSource::ALL
            .iter()
            .any(|source| self.input.is_enabled(*source))
    }
}
