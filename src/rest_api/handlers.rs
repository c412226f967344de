//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::{error, instrument};

use crate::controller::conditions::CONDITION_STATUS_TRUE;
use crate::controller::{load_telemetry, ControllerState};
use crate::crd::{LogPipeline, MetricPipeline, TelemetryPipeline, TracePipeline};

use super::dto::{
    ErrorResponse, HealthResponse, PipelineListResponse, PipelineSummary, ReadyResponse,
    TelemetryResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Liveness probe
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe. Standby replicas are ready too; they only skip reconciles.
#[instrument(skip(state))]
pub async fn ready(State(state): State<Arc<ControllerState>>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        ready: true,
        leader: state.is_leader(),
    })
}

#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    crate::controller::metrics::encode().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

pub(super) fn summarize<P: TelemetryPipeline>(pipeline: &P) -> PipelineSummary {
    let failing = pipeline
        .conditions()
        .iter()
        .find(|c| c.status != CONDITION_STATUS_TRUE);

    PipelineSummary {
        name: pipeline.name_any(),
        signal: P::SIGNAL.as_str().to_string(),
        healthy: !pipeline.conditions().is_empty() && failing.is_none(),
        failing_condition: failing.map(|c| c.type_.clone()),
        message: failing.map(|c| c.message.clone()),
    }
}

async fn list_summaries<P: TelemetryPipeline>(
    state: &ControllerState,
) -> Result<Vec<PipelineSummary>, ApiError> {
    let api: Api<P> = Api::all(state.client.clone());
    match api.list(&ListParams::default()).await {
        Ok(list) => Ok(list.items.iter().map(summarize).collect()),
        Err(e) => {
            error!("Failed to list {}: {:?}", P::SIGNAL.pipeline_kind(), e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// List the pipelines of every signal with a one-line health verdict
#[instrument(skip(state))]
pub async fn list_pipelines(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<PipelineListResponse>, ApiError> {
    let mut items = list_summaries::<LogPipeline>(&state).await?;
    items.extend(list_summaries::<MetricPipeline>(&state).await?);
    items.extend(list_summaries::<TracePipeline>(&state).await?);

    let total = items.len();
    Ok(Json(PipelineListResponse { items, total }))
}

/// Show the cluster-wide Telemetry resource, if one exists
#[instrument(skip(state))]
pub async fn get_telemetry(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<TelemetryResponse>, ApiError> {
    let telemetry = load_telemetry(&state.client).await.map_err(|e| {
        error!("Failed to load Telemetry resource: {:?}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("list_failed", &e.to_string())),
        )
    })?;

    let Some(telemetry) = telemetry else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", "No Telemetry resource exists")),
        ));
    };

    let status = telemetry.status.clone().unwrap_or_default();
    Ok(Json(TelemetryResponse {
        name: telemetry.name_any(),
        state: status.state,
        conditions: status.conditions,
        endpoints: status.endpoints,
    }))
}
