//! Pipeline reconciler
//!
//! Runs one kube-rs controller per signal. Whichever pipeline triggered
//! it, a reconcile always handles the whole signal: all pipelines are
//! validated together, the shared gateway and agent workloads are
//! rendered from the reconcilable ones, and every pipeline gets a fresh
//! status. Reconciles of one signal are serialized by a per-signal lock.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::config::fluent_bit::{self, FluentBitOptions};
use super::config::gateway::{self, GatewayFilters};
use super::config::{metric_agent, BuildOptions, EnvVars};
use super::overrides::{load_overrides, DEFAULT_OVERRIDE_CONFIG_MAP};
use super::prober::WorkloadProber;
use super::resources::{
    self, Component, WorkloadDocuments, WorkloadOptions, DEFAULT_GATEWAY_REPLICAS, FIELD_MANAGER,
    MANAGED_BY_LABEL, NAME_LABEL,
};
use super::secrets::{KubeSecretStore, ResolvedValues, SecretResolver};
use super::self_monitor::{flow_health, FlowSnapshot, FlowSource, SelfMonitorClient};
use super::status::{self, ComponentState, PipelineVerdicts};
use super::validation::{reconcilable, validate_all, Validated};
use crate::crd::{
    LogPipeline, MetricPipeline, Signal, Telemetry, TelemetryPipeline, TracePipeline,
};
use crate::error::{Error, Result};

#[cfg(feature = "metrics")]
use super::metrics;

pub const DEFAULT_COLLECTOR_IMAGE: &str = "otel/opentelemetry-collector-contrib:0.102.1";
pub const DEFAULT_LOG_AGENT_IMAGE: &str = "fluent/fluent-bit:3.0.7";
pub const DEFAULT_MAX_PIPELINES: usize = 5;
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(120);

/// Periodic resync, so probes and flow health stay current
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);
const BACKOFF_BASE_SECS: u64 = 15;
const BACKOFF_CAP_SECS: u64 = 300;
const NON_RETRIABLE_DELAY_SECS: u64 = 60;

/// Settings shared by all controllers
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace holding every managed workload
    pub namespace: String,
    pub max_pipelines: usize,
    pub collector_image: String,
    pub log_agent_image: String,
    pub priority_class: Option<String>,
    pub override_config_map: String,
    pub reconcile_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "telemetry-system".to_string(),
            max_pipelines: DEFAULT_MAX_PIPELINES,
            collector_image: DEFAULT_COLLECTOR_IMAGE.to_string(),
            log_agent_image: DEFAULT_LOG_AGENT_IMAGE.to_string(),
            priority_class: None,
            override_config_map: DEFAULT_OVERRIDE_CONFIG_MAP.to_string(),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

/// Shared state for the controllers
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub self_monitor: SelfMonitorClient,
    pub is_leader: Arc<AtomicBool>,
    signal_locks: [Mutex<()>; 3],
    failures: std::sync::Mutex<HashMap<String, u32>>,
}

impl ControllerState {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        self_monitor: SelfMonitorClient,
        is_leader: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client,
            config,
            self_monitor,
            is_leader,
            signal_locks: Default::default(),
            failures: Default::default(),
        }
    }

    fn signal_lock(&self, signal: Signal) -> &Mutex<()> {
        match signal {
            Signal::Logs => &self.signal_locks[0],
            Signal::Metrics => &self.signal_locks[1],
            Signal::Traces => &self.signal_locks[2],
        }
    }

    /// Count a failed reconcile of `key`; returns the failures before this one
    pub(crate) fn record_failure(&self, key: &str) -> u32 {
        let Ok(mut failures) = self.failures.lock() else {
            return 0;
        };
        let count = failures.entry(key.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub(crate) fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }
}

/// Exponential backoff: base * 2^attempt, capped at max
pub fn calculate_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let delay = base_secs.saturating_mul(2_u64.saturating_pow(attempt.min(16)));
    Duration::from_secs(delay.min(max_secs))
}

/// Requeue delay after the `attempt`-th consecutive failure (0-based)
pub fn retry_delay(error: &Error, attempt: u32) -> Duration {
    if error.is_retriable() {
        calculate_backoff(attempt, BACKOFF_BASE_SECS, BACKOFF_CAP_SECS)
    } else {
        calculate_backoff(attempt, NON_RETRIABLE_DELAY_SECS, BACKOFF_CAP_SECS)
    }
}

// ---------------------------------------------------------------------------
// Per-signal rendering
// ---------------------------------------------------------------------------

/// Pipeline kinds the reconciler can drive
pub trait SignalPipeline: GatewayFilters {
    /// Agent documents for the reconcilable pipelines; `None` when no
    /// pipeline needs the agent
    fn agent_documents(
        pipelines: &[(&Self, &ResolvedValues)],
        opts: &BuildOptions,
    ) -> Result<Option<WorkloadDocuments>>;
}

impl SignalPipeline for TracePipeline {
    fn agent_documents(
        _pipelines: &[(&Self, &ResolvedValues)],
        _opts: &BuildOptions,
    ) -> Result<Option<WorkloadDocuments>> {
        Ok(None)
    }
}

impl SignalPipeline for MetricPipeline {
    fn agent_documents(
        pipelines: &[(&Self, &ResolvedValues)],
        opts: &BuildOptions,
    ) -> Result<Option<WorkloadDocuments>> {
        let agent: Vec<&MetricPipeline> = pipelines
            .iter()
            .map(|(p, _)| *p)
            .filter(|p| p.requires_agent())
            .collect();
        if agent.is_empty() {
            return Ok(None);
        }
        let config = metric_agent::build(&agent, opts)?;
        Ok(Some(WorkloadDocuments::Collector {
            config: config.to_yaml()?,
            env: EnvVars::new(),
        }))
    }
}

impl SignalPipeline for LogPipeline {
    fn agent_documents(
        pipelines: &[(&Self, &ResolvedValues)],
        opts: &BuildOptions,
    ) -> Result<Option<WorkloadDocuments>> {
        if !pipelines.iter().any(|(p, _)| p.requires_agent()) {
            return Ok(None);
        }
        let fluent_bit_opts = FluentBitOptions {
            workload_name: Component::Agent
                .workload_name(Signal::Logs)
                .unwrap_or_default(),
            namespace: opts.namespace.clone(),
            log_level: opts.log_level.clone(),
            cluster_name: opts.cluster_name.clone(),
        };
        Ok(Some(WorkloadDocuments::FluentBit(fluent_bit::build(
            pipelines,
            &fluent_bit_opts,
        )?)))
    }
}

/// Documents each workload of a signal should run with
#[derive(Debug, Default)]
pub struct Plan {
    pub gateway: Option<WorkloadDocuments>,
    pub agent: Option<WorkloadDocuments>,
}

impl Plan {
    pub fn documents(&self, component: Component) -> Option<&WorkloadDocuments> {
        match component {
            Component::Gateway => self.gateway.as_ref(),
            Component::Agent => self.agent.as_ref(),
        }
    }
}

/// Render the workloads for the reconcilable pipelines
///
/// A workload no reconcilable pipeline needs has no documents and is
/// removed.
pub fn plan<P: SignalPipeline>(
    pipelines: &[(&P, &ResolvedValues)],
    opts: &BuildOptions,
) -> Result<Plan> {
    let gateway = if pipelines.iter().any(|(p, _)| p.requires_gateway()) {
        let (config, env) = gateway::build(pipelines, opts)?;
        Some(WorkloadDocuments::Collector {
            config: config.to_yaml()?,
            env,
        })
    } else {
        None
    };
    Ok(Plan {
        gateway,
        agent: P::agent_documents(pipelines, opts)?,
    })
}

pub fn build_options(
    telemetry: Option<&Telemetry>,
    log_level: &str,
    namespace: &str,
) -> BuildOptions {
    BuildOptions {
        cluster_name: telemetry
            .and_then(|t| t.spec.cluster_name())
            .map(str::to_string),
        pod_labels: telemetry
            .map(|t| t.spec.pod_label_rules().to_vec())
            .unwrap_or_default(),
        log_level: log_level.to_string(),
        namespace: namespace.to_string(),
    }
}

pub fn workload_options(
    config: &OperatorConfig,
    telemetry: Option<&Telemetry>,
    signal: Signal,
) -> WorkloadOptions {
    WorkloadOptions {
        namespace: config.namespace.clone(),
        collector_image: config.collector_image.clone(),
        log_agent_image: config.log_agent_image.clone(),
        priority_class: config.priority_class.clone(),
        gateway_replicas: telemetry
            .and_then(|t| t.spec.static_gateway_replicas(signal))
            .unwrap_or(DEFAULT_GATEWAY_REPLICAS),
    }
}

/// The Telemetry resource holding cluster-wide settings, oldest first
pub async fn load_telemetry(client: &Client) -> Result<Option<Telemetry>> {
    let api: Api<Telemetry> = Api::all(client.clone());
    let mut items = api.list(&ListParams::default()).await?.items;
    items.sort_by_key(|t| {
        (
            t.metadata.creation_timestamp.as_ref().map(|ts| ts.0),
            t.name_any(),
        )
    });
    Ok(items.into_iter().next())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Component the pipeline's configuration lands in
pub fn configured_component<P: TelemetryPipeline>(pipeline: &P) -> Component {
    if pipeline.requires_gateway() {
        Component::Gateway
    } else {
        Component::Agent
    }
}

/// Log pipelines with an agent are exported by Fluent Bit
pub fn flow_source<P: TelemetryPipeline>(pipeline: &P) -> FlowSource {
    if P::SIGNAL == Signal::Logs && pipeline.requires_agent() {
        FlowSource::FluentBit
    } else {
        FlowSource::Collector
    }
}

/// Gather the verdicts for one pipeline from the signal-wide probes
pub fn pipeline_verdicts<'a, P: TelemetryPipeline>(
    validated: &'a Validated<'_, P>,
    gateway: &ComponentState,
    agent: &ComponentState,
    snapshot: Option<&FlowSnapshot>,
) -> PipelineVerdicts<'a> {
    let pipeline = validated.pipeline;
    let pick = |required: bool, state: &ComponentState| {
        if required {
            state.clone()
        } else {
            ComponentState::NotRequired
        }
    };
    PipelineVerdicts {
        outcome: &validated.outcome,
        configured: configured_component(pipeline),
        gateway: pick(pipeline.requires_gateway(), gateway),
        agent: pick(pipeline.requires_agent(), agent),
        flow: flow_health(
            snapshot,
            P::SIGNAL,
            flow_source(pipeline),
            &pipeline.name_any(),
            validated.outcome.is_reconcilable(),
        ),
    }
}

async fn probe_component(
    prober: &WorkloadProber,
    signal: Signal,
    component: Component,
    needed: bool,
    namespace: &str,
) -> ComponentState {
    let Some(name) = component.workload_name(signal).filter(|_| needed) else {
        return ComponentState::NotRequired;
    };
    match prober.probe(component.workload(), &name, namespace).await {
        Ok(result) => ComponentState::Probed(result),
        Err(e) => {
            warn!(
                "Failed to probe {} {}/{}: {}",
                component.workload(),
                namespace,
                name,
                e
            );
            ComponentState::ProbeFailed(e.to_string())
        }
    }
}

async fn write_status<P: TelemetryPipeline>(
    client: &Client,
    validated: &Validated<'_, P>,
    gateway: &ComponentState,
    agent: &ComponentState,
    snapshot: Option<&FlowSnapshot>,
    now: DateTime<Utc>,
) -> Result<()> {
    let pipeline = validated.pipeline;
    let name = pipeline.name_any();
    let verdicts = pipeline_verdicts(validated, gateway, agent, snapshot);
    let desired = status::pipeline_conditions(
        P::SIGNAL,
        &verdicts,
        pipeline.generation(),
        pipeline.conditions(),
        now,
    );

    let current = !status::needs_update(pipeline.conditions(), &desired);
    if current && pipeline.status_extras_current() {
        debug!("Status of {} {} is current", P::SIGNAL.pipeline_kind(), name);
        return Ok(());
    }

    let api: Api<P> = Api::all(client.clone());
    let patch = json!({ "status": pipeline.status_patch(&desired) });
    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;

    #[cfg(feature = "metrics")]
    metrics::inc_status_write(P::SIGNAL.pipeline_kind());

    debug!("Updated status of {} {}", P::SIGNAL.pipeline_kind(), name);
    Ok(())
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

/// Reconcile every pipeline of `P::SIGNAL`
#[instrument(skip(ctx), fields(signal = %P::SIGNAL))]
pub async fn reconcile_signal<P: SignalPipeline>(ctx: &ControllerState) -> Result<()> {
    let signal = P::SIGNAL;
    let _guard = ctx.signal_lock(signal).lock().await;
    let client = &ctx.client;
    let config = &ctx.config;

    let overrides =
        load_overrides(client, &config.namespace, &config.override_config_map).await?;
    if overrides.is_paused(signal) {
        info!("Reconciliation of {} is paused by overrides", signal);
        return Ok(());
    }

    let api: Api<P> = Api::all(client.clone());
    let pipelines = api.list(&ListParams::default()).await?.items;
    let telemetry = load_telemetry(client).await?;
    let now = Utc::now();

    let mut resolver = SecretResolver::new(KubeSecretStore::new(client.clone()));
    let validated = validate_all(&pipelines, &mut resolver, config.max_pipelines, now).await?;
    let admitted = reconcilable(&validated);
    info!(
        "{} of {} {}s are reconcilable",
        admitted.len(),
        validated.len(),
        signal.pipeline_kind()
    );

    #[cfg(feature = "metrics")]
    metrics::set_reconcilable_pipelines(signal.as_str(), admitted.len() as i64);

    let build_opts = build_options(
        telemetry.as_ref(),
        overrides.collector_log_level(),
        &config.namespace,
    );
    let plan = plan::<P>(&admitted, &build_opts)?;
    let owner_list: Vec<&P> = admitted.iter().map(|(p, _)| *p).collect();
    let owners = resources::owner_references(&owner_list);
    let workload_opts = workload_options(config, telemetry.as_ref(), signal);

    for component in [Component::Gateway, Component::Agent] {
        let Some(name) = component.workload_name(signal) else {
            continue;
        };
        match plan.documents(component) {
            Some(documents) => {
                let bundle =
                    resources::build_bundle(signal, component, documents, &owners, &workload_opts)?;
                resources::apply_bundle(client, &bundle).await?;
            }
            None => resources::delete_bundle(client, &name, &config.namespace).await?,
        }
    }

    let prober = WorkloadProber::new(client.clone());
    let gateway = probe_component(
        &prober,
        signal,
        Component::Gateway,
        validated.iter().any(|v| v.pipeline.requires_gateway()),
        &config.namespace,
    )
    .await;
    let agent = probe_component(
        &prober,
        signal,
        Component::Agent,
        validated.iter().any(|v| v.pipeline.requires_agent()),
        &config.namespace,
    )
    .await;

    let snapshot = if admitted.is_empty() {
        None
    } else {
        ctx.self_monitor.try_sample().await
    };

    update_each(validated.iter().map(|v| {
        (
            v.pipeline.name_any(),
            write_status(client, v, &gateway, &agent, snapshot.as_ref(), now),
        )
    })
    .collect::<Vec<_>>())
    .await
}

/// Await every named update in turn, carrying on past failures
///
/// Returns the first error once all updates had their turn.
pub async fn update_each<I, F>(updates: I) -> Result<()>
where
    I: IntoIterator<Item = (String, F)>,
    F: Future<Output = Result<()>>,
{
    let mut first = None;
    let mut failed = 0;
    for (name, update) in updates {
        if let Err(e) = update.await {
            warn!("Failed to update the status of {}: {}", name, e);
            failed += 1;
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => {
            if failed > 1 {
                warn!("{} status updates failed", failed);
            }
            Err(e)
        }
        None => Ok(()),
    }
}

fn controller_name<P: TelemetryPipeline>() -> String {
    P::SIGNAL.pipeline_kind().to_lowercase()
}

fn failure_key<P: TelemetryPipeline>(pipeline: &P) -> String {
    format!("{}/{}", P::SIGNAL.pipeline_kind(), pipeline.name_any())
}

/// The reconciliation function
///
/// Called whenever a pipeline of the signal, a referenced Secret, a
/// managed workload or its pods, or the Telemetry resource changes,
/// and on every resync.
#[instrument(skip(pipeline, ctx), fields(name = %pipeline.name_any()))]
async fn reconcile<P: SignalPipeline>(
    pipeline: Arc<P>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    if !ctx.is_leader() {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let started = Instant::now();
    let budget = ctx.config.reconcile_timeout;
    let result = match tokio::time::timeout(budget, reconcile_signal::<P>(&ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(budget.as_secs())),
    };

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(
        &controller_name::<P>(),
        started.elapsed().as_secs_f64(),
    );
    debug!("Reconcile took {:?}", started.elapsed());

    result?;
    ctx.reset_failures(&failure_key(pipeline.as_ref()));
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy: exponential backoff per pipeline
fn error_policy<P: SignalPipeline>(
    pipeline: Arc<P>,
    error: &Error,
    ctx: Arc<ControllerState>,
) -> Action {
    let attempt = ctx.record_failure(&failure_key(pipeline.as_ref()));
    let delay = retry_delay(error, attempt);
    error!(
        "Reconciliation error for {} {} (attempt {}), retrying in {:?}: {:?}",
        P::SIGNAL.pipeline_kind(),
        pipeline.name_any(),
        attempt + 1,
        delay,
        error
    );

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(&controller_name::<P>(), error.metric_label());

    Action::requeue(delay)
}

// ---------------------------------------------------------------------------
// Watches
// ---------------------------------------------------------------------------

/// Any one pipeline of the signal, skipping `except`
fn any_pipeline<P: TelemetryPipeline>(
    store: &Store<P>,
    except: Option<&str>,
) -> Vec<ObjectRef<P>> {
    store
        .state()
        .into_iter()
        .filter(|p| Some(p.name_any().as_str()) != except)
        .min_by_key(|p| p.name_any())
        .map(|p| ObjectRef::from_obj(p.as_ref()))
        .into_iter()
        .collect()
}

/// Whether a managed object belongs to one of the signal's workloads
pub fn is_signal_workload(signal: Signal, labels: &BTreeMap<String, String>) -> bool {
    let Some(name) = labels.get(NAME_LABEL) else {
        return false;
    };
    [Component::Gateway, Component::Agent]
        .iter()
        .filter_map(|c| c.workload_name(signal))
        .any(|w| &w == name)
}

fn workload_trigger<P, K>(
    store: Store<P>,
) -> impl Fn(K) -> Vec<ObjectRef<P>> + Send + Sync + 'static
where
    P: TelemetryPipeline,
    K: Resource,
{
    move |object: K| {
        if is_signal_workload(P::SIGNAL, object.labels()) {
            any_pipeline(&store, None)
        } else {
            Vec::new()
        }
    }
}

/// Start the controller for one pipeline kind
pub async fn run_pipeline_controller<P: SignalPipeline>(
    state: Arc<ControllerState>,
) -> Result<()> {
    let client = state.client.clone();
    let kind = P::SIGNAL.pipeline_kind();
    let pipelines: Api<P> = Api::all(client.clone());

    info!("Starting {} controller", kind);

    // Verify CRD exists
    if let Err(e) = pipelines.list(&ListParams::default().limit(1)).await {
        error!("{} CRD not found. Please install the CRDs first: {:?}", kind, e);
        return Err(Error::ConfigError(format!("{kind} CRD not installed")));
    }

    let namespace = state.config.namespace.clone();
    let managed = Config::default().labels(&format!("{MANAGED_BY_LABEL}={FIELD_MANAGER}"));

    let controller = Controller::new(pipelines.clone(), Config::default());
    let store = controller.store();
    let secret_store = store.clone();
    let sibling_store = store.clone();
    let telemetry_store = store.clone();

    controller
        .watches(Api::<Secret>::all(client.clone()), Config::default(), move |secret| {
            let name = secret.name_any();
            let namespace = secret.namespace().unwrap_or_default();
            secret_store
                .state()
                .into_iter()
                .filter(|p| p.references_secret(&name, &namespace))
                .map(|p| ObjectRef::from_obj(p.as_ref()))
                .collect::<Vec<_>>()
        })
        // A deleted pipeline must reshape the bundle of the remaining ones
        .watches(pipelines, Config::default(), move |pipeline: P| {
            any_pipeline(&sibling_store, Some(pipeline.name_any().as_str()))
        })
        .watches(
            Api::<Deployment>::namespaced(client.clone(), &namespace),
            managed.clone(),
            workload_trigger::<P, Deployment>(store.clone()),
        )
        .watches(
            Api::<DaemonSet>::namespaced(client.clone(), &namespace),
            managed.clone(),
            workload_trigger::<P, DaemonSet>(store.clone()),
        )
        .watches(
            Api::<Pod>::namespaced(client.clone(), &namespace),
            managed,
            workload_trigger::<P, Pod>(store),
        )
        .watches(Api::<Telemetry>::all(client), Config::default(), move |_| {
            any_pipeline(&telemetry_store, None)
        })
        .shutdown_on_signal()
        .run(reconcile::<P>, error_policy::<P>, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}
