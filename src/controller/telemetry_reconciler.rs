//! Telemetry resource reconciler
//!
//! Rolls the pipeline conditions of every signal up into the Telemetry
//! resource, publishes the gateway endpoints and guards its deletion
//! while pipelines still exist.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::conditions::{
    conditions_equivalent, new_condition, preserve_transition_times, CONDITION_STATUS_FALSE,
    REASON_RESOURCE_BLOCKS_DELETION,
};
use super::config::{OTLP_GRPC_PORT, OTLP_HTTP_PORT};
use super::messages::blocks_deletion_message;
use super::reconciler::{retry_delay, ControllerState};
use super::resources::{self, Component, FIELD_MANAGER, MANAGED_BY_LABEL};
use super::status::{components_condition, components_condition_type, telemetry_state};
use crate::crd::{
    Condition, GatewayEndpoints, LogPipeline, MetricPipeline, OtlpEndpoints, Signal, Telemetry,
    TelemetryPipeline, TelemetryState, TelemetryStatus, TracePipeline,
};
use crate::error::{Error, Result};

#[cfg(feature = "metrics")]
use super::metrics;

/// Finalizer name used to guard the Telemetry resource
pub const TELEMETRY_FINALIZER: &str = "telemetry.kube-ops.io/finalizer";

const CONTROLLER_NAME: &str = "telemetry";
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);
const DELETION_BLOCKED_REQUEUE: Duration = Duration::from_secs(10);
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);

/// Live pipelines of one signal, sorted by name
#[derive(Clone, Debug)]
pub struct SignalPipelines {
    pub signal: Signal,
    pub names: Vec<String>,
    pub conditions: Vec<Vec<Condition>>,
}

async fn signal_pipelines<P: TelemetryPipeline>(client: &Client) -> Result<SignalPipelines> {
    let api: Api<P> = Api::all(client.clone());
    let mut items: Vec<P> = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|p| !p.is_being_deleted())
        .collect();
    items.sort_by_key(|p| p.name_any());
    Ok(SignalPipelines {
        signal: P::SIGNAL,
        names: items.iter().map(|p| p.name_any()).collect(),
        conditions: items.iter().map(|p| p.conditions().to_vec()).collect(),
    })
}

async fn all_signal_pipelines(client: &Client) -> Result<Vec<SignalPipelines>> {
    Ok(vec![
        signal_pipelines::<LogPipeline>(client).await?,
        signal_pipelines::<MetricPipeline>(client).await?,
        signal_pipelines::<TracePipeline>(client).await?,
    ])
}

/// OTLP URLs of a signal's gateway Service
pub fn gateway_endpoints(signal: Signal, namespace: &str) -> Option<OtlpEndpoints> {
    let service = Component::Gateway.workload_name(signal)?;
    Some(OtlpEndpoints {
        grpc: format!("http://{service}.{namespace}:{OTLP_GRPC_PORT}"),
        http: format!("http://{service}.{namespace}:{OTLP_HTTP_PORT}"),
    })
}

async fn published_endpoints(client: &Client, namespace: &str) -> Result<GatewayEndpoints> {
    let mut endpoints = GatewayEndpoints::default();
    for signal in Signal::ALL {
        if !resources::gateway_service_exists(client, signal, namespace).await? {
            continue;
        }
        let urls = gateway_endpoints(signal, namespace);
        match signal {
            Signal::Logs => endpoints.logs = urls,
            Signal::Metrics => endpoints.metrics = urls,
            Signal::Traces => endpoints.traces = urls,
        }
    }
    Ok(endpoints)
}

/// Compute the status of the Telemetry resource
///
/// While the resource is being deleted and pipelines remain, every
/// components condition reports the blocking pipelines instead.
pub fn desired_status(
    signals: &[SignalPipelines],
    endpoints: GatewayEndpoints,
    deleting: bool,
    generation: Option<i64>,
    previous: &[Condition],
    now: DateTime<Utc>,
) -> TelemetryStatus {
    let blocking: Vec<(&str, Vec<String>)> = signals
        .iter()
        .map(|s| (s.signal.pipeline_kind(), s.names.clone()))
        .collect();
    let blocked = deleting && blocking.iter().any(|(_, names)| !names.is_empty());

    let mut conditions: Vec<Condition> = if blocked {
        let message = blocks_deletion_message(&blocking);
        signals
            .iter()
            .map(|s| {
                new_condition(
                    &components_condition_type(s.signal),
                    CONDITION_STATUS_FALSE,
                    REASON_RESOURCE_BLOCKS_DELETION,
                    &message,
                    generation,
                    now,
                )
            })
            .collect()
    } else {
        signals
            .iter()
            .map(|s| {
                let per_pipeline: Vec<&[Condition]> =
                    s.conditions.iter().map(Vec::as_slice).collect();
                components_condition(s.signal, &per_pipeline, generation, now)
            })
            .collect()
    };
    preserve_transition_times(&mut conditions, previous);

    let state = if blocked {
        TelemetryState::Warning
    } else if deleting {
        TelemetryState::Deleting
    } else {
        telemetry_state(&conditions)
    };

    TelemetryStatus {
        state,
        conditions,
        endpoints,
    }
}

fn status_changed(current: Option<&TelemetryStatus>, desired: &TelemetryStatus) -> bool {
    match current {
        None => true,
        Some(current) => {
            current.state != desired.state
                || current.endpoints != desired.endpoints
                || !conditions_equivalent(&current.conditions, &desired.conditions)
        }
    }
}

async fn write_status(
    api: &Api<Telemetry>,
    telemetry: &Telemetry,
    status: &TelemetryStatus,
) -> Result<()> {
    if !status_changed(telemetry.status.as_ref(), status) {
        debug!("Status of Telemetry {} is current", telemetry.name_any());
        return Ok(());
    }
    let patch = json!({ "status": status });
    api.patch_status(
        &telemetry.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    #[cfg(feature = "metrics")]
    metrics::inc_status_write("Telemetry");

    info!("Telemetry {} is {}", telemetry.name_any(), status.state);
    Ok(())
}

async fn set_finalizers(
    api: &Api<Telemetry>,
    telemetry: &Telemetry,
    finalizers: Vec<String>,
) -> Result<()> {
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &telemetry.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(|e| {
        Error::FinalizerError(format!(
            "updating finalizers of Telemetry {}: {}",
            telemetry.name_any(),
            e
        ))
    })?;
    Ok(())
}

fn has_finalizer(telemetry: &Telemetry) -> bool {
    telemetry.finalizers().iter().any(|f| f == TELEMETRY_FINALIZER)
}

#[instrument(skip(telemetry, ctx), fields(name = %telemetry.name_any()))]
async fn reconcile(telemetry: Arc<Telemetry>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader() {
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let client = &ctx.client;
    let api: Api<Telemetry> = Api::all(client.clone());
    let deleting = telemetry.metadata.deletion_timestamp.is_some();

    if !deleting && !has_finalizer(&telemetry) {
        let mut finalizers: Vec<String> = telemetry.finalizers().to_vec();
        finalizers.push(TELEMETRY_FINALIZER.to_string());
        set_finalizers(&api, &telemetry, finalizers).await?;
        info!("Added finalizer to Telemetry {}", telemetry.name_any());
    }

    let signals = all_signal_pipelines(client).await?;
    let endpoints = published_endpoints(client, &ctx.config.namespace).await?;
    let previous = telemetry
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let status = desired_status(
        &signals,
        endpoints,
        deleting,
        telemetry.metadata.generation,
        previous,
        Utc::now(),
    );
    write_status(&api, &telemetry, &status).await?;

    ctx.reset_failures(&format!("Telemetry/{}", telemetry.name_any()));

    if !deleting {
        return Ok(Action::requeue(RESYNC_INTERVAL));
    }
    if status.state == TelemetryState::Warning {
        warn!(
            "Deletion of Telemetry {} is blocked by existing pipelines",
            telemetry.name_any()
        );
        return Ok(Action::requeue(DELETION_BLOCKED_REQUEUE));
    }
    if has_finalizer(&telemetry) {
        let remaining: Vec<String> = telemetry
            .finalizers()
            .iter()
            .filter(|f| *f != TELEMETRY_FINALIZER)
            .cloned()
            .collect();
        set_finalizers(&api, &telemetry, remaining).await?;
        info!("Removed finalizer from Telemetry {}", telemetry.name_any());
    }
    Ok(Action::await_change())
}

fn error_policy(telemetry: Arc<Telemetry>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    let attempt = ctx.record_failure(&format!("Telemetry/{}", telemetry.name_any()));
    let delay = retry_delay(error, attempt);
    error!(
        "Reconciliation error for Telemetry {}, retrying in {:?}: {:?}",
        telemetry.name_any(),
        delay,
        error
    );

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER_NAME, error.metric_label());

    Action::requeue(delay)
}

fn every_telemetry<K>(
    store: Store<Telemetry>,
) -> impl Fn(K) -> Vec<ObjectRef<Telemetry>> + Send + Sync + 'static {
    move |_| {
        store
            .state()
            .iter()
            .map(|t| ObjectRef::from_obj(t.as_ref()))
            .collect()
    }
}

/// Start the Telemetry controller
pub async fn run_telemetry_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let telemetries: Api<Telemetry> = Api::all(client.clone());

    info!("Starting {} controller", CONTROLLER_NAME);

    if let Err(e) = telemetries.list(&ListParams::default().limit(1)).await {
        error!("Telemetry CRD not found. Please install the CRDs first: {:?}", e);
        return Err(Error::ConfigError("Telemetry CRD not installed".to_string()));
    }

    let managed = Config::default().labels(&format!("{MANAGED_BY_LABEL}={FIELD_MANAGER}"));
    let controller = Controller::new(telemetries, Config::default());
    let store = controller.store();

    controller
        .watches(
            Api::<LogPipeline>::all(client.clone()),
            Config::default(),
            every_telemetry(store.clone()),
        )
        .watches(
            Api::<MetricPipeline>::all(client.clone()),
            Config::default(),
            every_telemetry(store.clone()),
        )
        .watches(
            Api::<TracePipeline>::all(client.clone()),
            Config::default(),
            every_telemetry(store.clone()),
        )
        .watches(
            Api::<Service>::namespaced(client, &state.config.namespace),
            managed,
            every_telemetry(store),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}
