//! TracePipeline Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, OtlpOutput};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "telemetry.kube-ops.io",
    version = "v1alpha1",
    kind = "TracePipeline",
    status = "TracePipelineStatus",
    shortname = "tp",
    printcolumn = r#"{"name":"Configuration Generated","type":"string","jsonPath":".status.conditions[?(@.type=='ConfigurationGenerated')].status"}"#,
    printcolumn = r#"{"name":"Gateway Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='GatewayHealthy')].status"}"#,
    printcolumn = r#"{"name":"Flow Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='TelemetryFlowHealthy')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TracePipelineSpec {
    pub output: TraceOutput,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TraceOutput {
    pub otlp: OtlpOutput,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TracePipelineStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
