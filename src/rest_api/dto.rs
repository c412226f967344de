//! Response bodies for the REST API

use serde::Serialize;

use crate::crd::{Condition, GatewayEndpoints, TelemetryState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub ready: bool,
    pub leader: bool,
}

/// One pipeline as listed by `/api/v1/pipelines`
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub name: String,
    pub signal: String,
    /// True when every condition on the pipeline is True
    pub healthy: bool,
    /// Type of the first condition that is not True
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PipelineListResponse {
    pub items: Vec<PipelineSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryResponse {
    pub name: String,
    pub state: TelemetryState,
    pub conditions: Vec<Condition>,
    pub endpoints: GatewayEndpoints,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
