use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use telemetry_k8s::controller::{self, ControllerState, OperatorConfig, SelfMonitorClient};
use telemetry_k8s::crd::{LogPipeline, MetricPipeline, TracePipeline};
use telemetry_k8s::Error;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the pipelines known to the cluster
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace holding the managed gateways and agents
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "telemetry-system")]
    namespace: String,

    /// Pipelines admitted per signal; the oldest win
    #[arg(long, env = "MAX_PIPELINES", default_value_t = controller::DEFAULT_MAX_PIPELINES)]
    max_pipelines: usize,

    /// Image of the OpenTelemetry collector used by gateways and metric agents
    #[arg(long, env = "COLLECTOR_IMAGE", default_value = controller::DEFAULT_COLLECTOR_IMAGE)]
    collector_image: String,

    /// Image of the Fluent Bit log agent
    #[arg(long, env = "LOG_AGENT_IMAGE", default_value = controller::DEFAULT_LOG_AGENT_IMAGE)]
    log_agent_image: String,

    /// PriorityClass assigned to managed workloads
    #[arg(long, env = "PRIORITY_CLASS")]
    priority_class: Option<String>,

    /// Metrics endpoint of the self-monitor
    /// (defaults to http://telemetry-self-monitor.<namespace>:9090/metrics)
    #[arg(long, env = "SELF_MONITOR_URL")]
    self_monitor_url: Option<String>,

    /// Time budget for a single reconcile
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 120)]
    reconcile_timeout_secs: u64,

    /// ConfigMap holding operator overrides (pause, collector log level)
    #[arg(long, env = "OVERRIDE_CONFIG_MAP", default_value = controller::overrides::DEFAULT_OVERRIDE_CONFIG_MAP)]
    override_config: String,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION", default_value_t = true, action = clap::ArgAction::Set)]
    leader_election: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Listen address of the health, metrics and REST endpoints
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,
}

#[derive(Parser, Debug)]
struct InfoArgs {}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Telemetry Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(_args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let logs: Api<LogPipeline> = Api::all(client.clone());
    let metrics: Api<MetricPipeline> = Api::all(client.clone());
    let traces: Api<TracePipeline> = Api::all(client);

    let lp = ListParams::default();
    println!("LogPipelines: {}", logs.list(&lp).await?.items.len());
    println!("MetricPipelines: {}", metrics.list(&lp).await?.items.len());
    println!("TracePipelines: {}", traces.list(&lp).await?.items.len());
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
    };

    // The OTLP layer is None unless OTEL_EXPORTER_OTLP_ENDPOINT is set
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(telemetry_k8s::telemetry::init_telemetry())
        .init();
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!("Starting Telemetry Operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let is_leader = Arc::new(AtomicBool::new(!args.leader_election));

    if args.leader_election {
        let leader_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });

        info!("Leader election using holder ID: {}", holder_identity);

        let lease_client = client.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(lease_client, &leader_namespace, &holder_identity, is_leader_bg)
                .await;
        });
    } else {
        info!("Leader election disabled; reconciling as the only replica");
    }

    let self_monitor_url = args.self_monitor_url.clone().unwrap_or_else(|| {
        format!(
            "http://telemetry-self-monitor.{}:9090/metrics",
            args.namespace
        )
    });
    let self_monitor = SelfMonitorClient::new(self_monitor_url)?;

    let config = OperatorConfig {
        namespace: args.namespace.clone(),
        max_pipelines: args.max_pipelines,
        collector_image: args.collector_image.clone(),
        log_agent_image: args.log_agent_image.clone(),
        priority_class: args.priority_class.clone(),
        override_config_map: args.override_config.clone(),
        reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
    };

    let state = Arc::new(ControllerState::new(
        client,
        config,
        self_monitor,
        Arc::clone(&is_leader),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let addr = args.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = telemetry_k8s::rest_api::run_server(api_state, addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    // Each controller stops on SIGTERM; the first error stops the rest
    let result = tokio::try_join!(
        controller::run_pipeline_controller::<LogPipeline>(state.clone()),
        controller::run_pipeline_controller::<MetricPipeline>(state.clone()),
        controller::run_pipeline_controller::<TracePipeline>(state.clone()),
        controller::run_telemetry_controller(state),
    )
    .map(|_| ());

    telemetry_k8s::telemetry::shutdown_telemetry();

    result
}

const LEASE_NAME: &str = "telemetry-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let existing = match leases.get_opt(LEASE_NAME).await? {
        Some(existing) => existing,
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            return Ok(true);
        }
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(true);
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(i64::from(duration))
        })
        .unwrap_or(true);

    if !expired {
        return Ok(false);
    }

    info!("Lease held by {:?} has expired, taking over", current_holder);
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
