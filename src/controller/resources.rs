//! Kubernetes resource builders for the collector workloads
//!
//! Every signal owns up to two workloads in the operator namespace: a
//! gateway Deployment and a per-node agent DaemonSet. Each workload comes
//! with a bundle of supporting objects (ServiceAccount, RBAC, ConfigMaps,
//! env Secret, Services, NetworkPolicy). The whole bundle is owned by
//! every reconcilable pipeline of the signal, and deleted as a whole when
//! none is left.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvFromSource,
    EnvVar, EnvVarSource, HTTPGetAction, HostPathVolumeSource, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, SecretEnvSource, SecretVolumeSource,
    SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use super::config::fluent_bit::{self, FluentBitConfig};
use super::config::{
    EnvVars, COLLECTOR_METRICS_PORT, ENV_NODE_NAME, ENV_POD_IP, HEALTH_CHECK_PORT, OTLP_GRPC_PORT,
    OTLP_HTTP_PORT,
};
use super::prober::WorkloadKind;
use crate::crd::{Signal, TelemetryPipeline};
use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "telemetry-operator";
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "telemetry.kube-ops.io/config-checksum";
/// Checksum of every object of a bundle, stamped on the workload once applied
pub const BUNDLE_CHECKSUM_ANNOTATION: &str = "telemetry.kube-ops.io/bundle-checksum";
pub const COLLECTOR_CONFIG_KEY: &str = "collector.yaml";
pub const DEFAULT_GATEWAY_REPLICAS: i32 = 2;

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

const COLLECTOR_CONTAINER: &str = "collector";
const FLUENT_BIT_CONTAINER: &str = "fluent-bit";
const FLUENT_BIT_METRICS_PORT: u16 = 2020;
const COLLECTOR_CONFIG_DIR: &str = "/conf";

/// Which side of the signal a workload serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    Gateway,
    Agent,
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Component::Gateway => "gateway",
            Component::Agent => "agent",
        }
    }

    pub fn workload(&self) -> WorkloadKind {
        match self {
            Component::Gateway => WorkloadKind::Deployment,
            Component::Agent => WorkloadKind::DaemonSet,
        }
    }

    /// Name of the workload for `signal`; traces have no agent
    pub fn workload_name(&self, signal: Signal) -> Option<String> {
        match (self, signal) {
            (Component::Agent, Signal::Traces) => None,
            _ => Some(format!(
                "telemetry-{}-{}",
                signal.short_name(),
                self.name()
            )),
        }
    }
}

/// Whether the workload runs the log agent rather than a collector
fn is_fluent_bit(signal: Signal, component: Component) -> bool {
    signal == Signal::Logs && component == Component::Agent
}

pub fn standard_labels(name: &str, component: Component) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(NAME_LABEL.to_string(), name.to_string());
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        component.name().to_string(),
    );
    labels.insert(
        MANAGED_BY_LABEL.to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/part-of".to_string(),
        "telemetry".to_string(),
    );
    labels
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(NAME_LABEL.to_string(), name.to_string())])
}

/// Owner reference to one pipeline. A bundle has several owners, so none
/// of them is the controller.
pub fn owner_reference<P: TelemetryPipeline>(pipeline: &P) -> OwnerReference {
    OwnerReference {
        api_version: P::api_version(&()).to_string(),
        kind: P::kind(&()).to_string(),
        name: pipeline.name_any(),
        uid: pipeline.meta().uid.clone().unwrap_or_default(),
        controller: Some(false),
        block_owner_deletion: Some(false),
    }
}

/// Owner references for all `pipelines`, sorted by name
pub fn owner_references<P: TelemetryPipeline>(pipelines: &[&P]) -> Vec<OwnerReference> {
    let mut owners: Vec<OwnerReference> = pipelines.iter().map(|p| owner_reference(*p)).collect();
    owners.sort_by(|a, b| a.name.cmp(&b.name));
    owners
}

/// Rendered configuration a workload runs with
#[derive(Clone, Debug, PartialEq)]
pub enum WorkloadDocuments {
    Collector { config: String, env: EnvVars },
    FluentBit(FluentBitConfig),
}

/// Cluster-wide settings of the managed workloads
#[derive(Clone, Debug, Default)]
pub struct WorkloadOptions {
    pub namespace: String,
    pub collector_image: String,
    pub log_agent_image: String,
    pub priority_class: Option<String>,
    pub gateway_replicas: i32,
}

/// Managed objects of one workload, ready to be applied
#[derive(Clone, Debug)]
pub struct WorkloadBundle {
    pub name: String,
    pub namespace: String,
    pub signal: Signal,
    pub component: Component,
    pub service_account: ServiceAccount,
    pub cluster_role: ClusterRole,
    pub cluster_role_binding: ClusterRoleBinding,
    pub config_maps: Vec<ConfigMap>,
    pub secrets: Vec<Secret>,
    pub services: Vec<Service>,
    pub network_policy: NetworkPolicy,
    pub workload: Workload,
}

#[derive(Clone, Debug)]
pub enum Workload {
    Deployment(Deployment),
    DaemonSet(DaemonSet),
}

impl Workload {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::Deployment(d) => &d.metadata,
            Workload::DaemonSet(d) => &d.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::Deployment(d) => &mut d.metadata,
            Workload::DaemonSet(d) => &mut d.metadata,
        }
    }
}

impl WorkloadBundle {
    /// Checksum over the serialized objects, computed when the bundle was built
    pub fn checksum(&self) -> Option<&str> {
        self.workload
            .metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(BUNDLE_CHECKSUM_ANNOTATION))
            .map(String::as_str)
    }

    /// Whether `live`, the metadata of the running workload, shows this
    /// exact bundle was applied already
    pub fn is_applied(&self, live: Option<&ObjectMeta>) -> bool {
        let Some(live) = live else {
            return false;
        };
        if live.deletion_timestamp.is_some() {
            return false;
        }
        let applied = live
            .annotations
            .as_ref()
            .and_then(|a| a.get(BUNDLE_CHECKSUM_ANNOTATION));
        matches!((applied, self.checksum()), (Some(a), Some(b)) if a == b)
    }
}

fn bundle_checksum(bundle: &WorkloadBundle) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&bundle.service_account)?);
    hasher.update(serde_json::to_vec(&bundle.cluster_role)?);
    hasher.update(serde_json::to_vec(&bundle.cluster_role_binding)?);
    for cm in &bundle.config_maps {
        hasher.update(serde_json::to_vec(cm)?);
    }
    for secret in &bundle.secrets {
        hasher.update(serde_json::to_vec(secret)?);
    }
    for service in &bundle.services {
        hasher.update(serde_json::to_vec(service)?);
    }
    hasher.update(serde_json::to_vec(&bundle.network_policy)?);
    match &bundle.workload {
        Workload::Deployment(d) => hasher.update(serde_json::to_vec(d)?),
        Workload::DaemonSet(d) => hasher.update(serde_json::to_vec(d)?),
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Names of every object a workload bundle may consist of
pub fn bundle_object_names(name: &str) -> BundleNames {
    BundleNames {
        workload: name.to_string(),
        config_maps: vec![name.to_string(), format!("{name}-parsers")],
        secrets: vec![format!("{name}-env"), format!("{name}-output-tls-config")],
        services: vec![name.to_string(), format!("{name}-metrics")],
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleNames {
    pub workload: String,
    pub config_maps: Vec<String>,
    pub secrets: Vec<String>,
    pub services: Vec<String>,
}

fn object_meta(
    name: &str,
    namespace: Option<&str>,
    component: Component,
    owners: &[OwnerReference],
    labels_for: &str,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(standard_labels(labels_for, component)),
        owner_references: Some(owners.to_vec()),
        ..Default::default()
    }
}

/// sha256 over config map and secret content, in key order
pub fn config_checksum(config_maps: &[ConfigMap], secrets: &[Secret]) -> String {
    let mut hasher = Sha256::new();
    for cm in config_maps {
        for (key, value) in cm.data.iter().flatten() {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
    }
    for secret in secrets {
        for (key, value) in secret.data.iter().flatten() {
            hasher.update(key.as_bytes());
            hasher.update(&value.0);
        }
    }
    hex::encode(hasher.finalize())
}

fn secret_from(meta: ObjectMeta, data: &BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: meta,
        data: Some(
            data.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn config_map_from(meta: ObjectMeta, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: meta,
        data: Some(data),
        ..Default::default()
    }
}

fn policy_rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let strings = |items: &[&str]| Some(items.iter().map(|s| s.to_string()).collect());
    PolicyRule {
        api_groups: strings(groups),
        resources: strings(resources),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn cluster_role_rules(signal: Signal, component: Component) -> Vec<PolicyRule> {
    let read = ["get", "list", "watch"];
    let mut rules = vec![policy_rule(&[""], &["namespaces", "pods"], &read)];
    if is_fluent_bit(signal, component) {
        return rules;
    }
    rules.push(policy_rule(&[""], &["nodes"], &read));
    rules.push(policy_rule(&["apps"], &["replicasets"], &read));
    if signal == Signal::Metrics && component == Component::Agent {
        rules.push(policy_rule(
            &[""],
            &["nodes/stats", "nodes/proxy", "services", "endpoints"],
            &read,
        ));
        rules.push(PolicyRule {
            non_resource_urls: Some(vec!["/metrics".to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        });
    }
    rules
}

fn metrics_port(signal: Signal, component: Component) -> u16 {
    if is_fluent_bit(signal, component) {
        FLUENT_BIT_METRICS_PORT
    } else {
        COLLECTOR_METRICS_PORT
    }
}

fn tcp_port(name: &str, port: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn build_services(
    name: &str,
    namespace: &str,
    signal: Signal,
    component: Component,
    owners: &[OwnerReference],
) -> Vec<Service> {
    let metrics = Service {
        metadata: object_meta(&format!("{name}-metrics"), Some(namespace), component, owners, name),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(name)),
            ports: Some(vec![ServicePort {
                target_port: Some(IntOrString::Int(i32::from(metrics_port(signal, component)))),
                ..tcp_port("http-metrics", COLLECTOR_METRICS_PORT)
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    if component == Component::Agent {
        return vec![metrics];
    }

    let otlp = Service {
        metadata: object_meta(name, Some(namespace), component, owners, name),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(name)),
            ports: Some(vec![
                tcp_port("grpc-collector", OTLP_GRPC_PORT),
                tcp_port("http-collector", OTLP_HTTP_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };
    vec![otlp, metrics]
}

/// Deny all ingress except the metrics port, plus OTLP for gateways
fn build_network_policy(
    name: &str,
    namespace: &str,
    signal: Signal,
    component: Component,
    owners: &[OwnerReference],
) -> NetworkPolicy {
    let mut ports = vec![metrics_port(signal, component)];
    if component == Component::Gateway {
        ports.extend([OTLP_GRPC_PORT, OTLP_HTTP_PORT]);
    }
    let ports = ports
        .into_iter()
        .map(|port| NetworkPolicyPort {
            port: Some(IntOrString::Int(i32::from(port))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    NetworkPolicy {
        metadata: object_meta(name, Some(namespace), component, owners, name),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector_labels(name)),
                ..Default::default()
            },
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                ports: Some(ports),
                from: None,
            }]),
            egress: None,
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        privileged: Some(false),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config_volume(volume: &str, config_map: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(volume: &str, secret: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_path_volume(volume: &str, path: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: u16) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(i32::from(port)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_from_secret(secret: &str) -> EnvFromSource {
    EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: Some(secret.to_string()),
            optional: Some(true),
        }),
        ..Default::default()
    }
}

fn collector_pod_spec(name: &str, image: &str, component: Component) -> PodSpec {
    let mut ports = vec![
        ContainerPort {
            name: Some("http-metrics".to_string()),
            container_port: i32::from(COLLECTOR_METRICS_PORT),
            ..Default::default()
        },
        ContainerPort {
            name: Some("health-check".to_string()),
            container_port: i32::from(HEALTH_CHECK_PORT),
            ..Default::default()
        },
    ];
    if component == Component::Gateway {
        ports.push(ContainerPort {
            name: Some("grpc-otlp".to_string()),
            container_port: i32::from(OTLP_GRPC_PORT),
            ..Default::default()
        });
        ports.push(ContainerPort {
            name: Some("http-otlp".to_string()),
            container_port: i32::from(OTLP_HTTP_PORT),
            ..Default::default()
        });
    }
    let (requests, limits) = match component {
        Component::Gateway => (quantities("25m", "32Mi"), quantities("700m", "500Mi")),
        Component::Agent => (quantities("15m", "50Mi"), quantities("1", "1200Mi")),
    };

    PodSpec {
        service_account_name: Some(name.to_string()),
        containers: vec![Container {
            name: COLLECTOR_CONTAINER.to_string(),
            image: Some(image.to_string()),
            args: Some(vec![format!(
                "--config={COLLECTOR_CONFIG_DIR}/{COLLECTOR_CONFIG_KEY}"
            )]),
            env: Some(vec![
                field_env(ENV_POD_IP, "status.podIP"),
                field_env(ENV_NODE_NAME, "spec.nodeName"),
            ]),
            env_from: Some(vec![env_from_secret(&format!("{name}-env"))]),
            ports: Some(ports),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            liveness_probe: Some(http_probe("/", HEALTH_CHECK_PORT)),
            readiness_probe: Some(http_probe("/", HEALTH_CHECK_PORT)),
            security_context: Some(restricted_security_context()),
            volume_mounts: Some(vec![mount("config", COLLECTOR_CONFIG_DIR, true)]),
            ..Default::default()
        }],
        volumes: Some(vec![config_volume("config", name)]),
        ..Default::default()
    }
}

fn fluent_bit_pod_spec(name: &str, image: &str) -> PodSpec {
    PodSpec {
        service_account_name: Some(name.to_string()),
        containers: vec![Container {
            name: FLUENT_BIT_CONTAINER.to_string(),
            image: Some(image.to_string()),
            args: Some(vec![format!(
                "--config={}/{}",
                fluent_bit::CONFIG_DIR,
                fluent_bit::CONFIG_FILE
            )]),
            env_from: Some(vec![env_from_secret(&format!("{name}-env"))]),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: i32::from(FLUENT_BIT_METRICS_PORT),
                ..Default::default()
            }]),
            resources: Some(ResourceRequirements {
                requests: Some(quantities("100m", "50Mi")),
                limits: Some(quantities("1", "1Gi")),
                ..Default::default()
            }),
            liveness_probe: Some(http_probe("/", FLUENT_BIT_METRICS_PORT)),
            readiness_probe: Some(http_probe("/api/v1/health", FLUENT_BIT_METRICS_PORT)),
            security_context: Some(SecurityContext {
                read_only_root_filesystem: Some(true),
                allow_privilege_escalation: Some(false),
                ..Default::default()
            }),
            volume_mounts: Some(vec![
                mount("config", fluent_bit::CONFIG_DIR, true),
                mount("parsers", fluent_bit::PARSERS_DIR, true),
                mount("output-tls-config", fluent_bit::TLS_DIR, true),
                mount("varlog", "/var/log", true),
                mount("data", "/data", false),
            ]),
            ..Default::default()
        }],
        volumes: Some(vec![
            config_volume("config", name),
            config_volume("parsers", &format!("{name}-parsers")),
            secret_volume("output-tls-config", &format!("{name}-output-tls-config")),
            host_path_volume("varlog", "/var/log"),
            host_path_volume("data", "/var/fluent-bit"),
        ]),
        ..Default::default()
    }
}

/// Assemble the bundle of one workload
pub fn build_bundle(
    signal: Signal,
    component: Component,
    documents: &WorkloadDocuments,
    owners: &[OwnerReference],
    options: &WorkloadOptions,
) -> Result<WorkloadBundle> {
    let name = component.workload_name(signal).ok_or_else(|| {
        Error::ConfigError(format!("signal {signal} has no {}", component.name()))
    })?;
    let namespace = options.namespace.as_str();
    let meta = |object: &str| object_meta(object, Some(namespace), component, owners, &name);

    let (config_maps, secrets) = match documents {
        WorkloadDocuments::Collector { config, env } => (
            vec![config_map_from(
                meta(&name),
                BTreeMap::from([(COLLECTOR_CONFIG_KEY.to_string(), config.clone())]),
            )],
            vec![secret_from(meta(&format!("{name}-env")), env)],
        ),
        WorkloadDocuments::FluentBit(fb) => (
            vec![
                config_map_from(
                    meta(&name),
                    BTreeMap::from([
                        (fluent_bit::CONFIG_FILE.to_string(), fb.main.clone()),
                        (fluent_bit::LUA_SCRIPT_FILE.to_string(), fb.lua_script.clone()),
                    ]),
                ),
                config_map_from(
                    meta(&format!("{name}-parsers")),
                    BTreeMap::from([(fluent_bit::PARSERS_FILE.to_string(), fb.parsers.clone())]),
                ),
            ],
            vec![
                secret_from(meta(&format!("{name}-env")), &fb.env),
                secret_from(meta(&format!("{name}-output-tls-config")), &fb.tls_files),
            ],
        ),
    };
    let checksum = config_checksum(&config_maps, &secrets);

    let mut pod_spec = if is_fluent_bit(signal, component) {
        fluent_bit_pod_spec(&name, &options.log_agent_image)
    } else {
        collector_pod_spec(&name, &options.collector_image, component)
    };
    pod_spec.priority_class_name = options.priority_class.clone();

    let mut pod_labels = standard_labels(&name, component);
    pod_labels.extend(selector_labels(&name));
    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            annotations: Some(BTreeMap::from([(
                CONFIG_CHECKSUM_ANNOTATION.to_string(),
                checksum,
            )])),
            ..Default::default()
        }),
        spec: Some(pod_spec),
    };
    let selector = LabelSelector {
        match_labels: Some(selector_labels(&name)),
        ..Default::default()
    };

    let workload = match component {
        Component::Gateway => Workload::Deployment(Deployment {
            metadata: meta(&name),
            spec: Some(DeploymentSpec {
                replicas: Some(if options.gateway_replicas > 0 {
                    options.gateway_replicas
                } else {
                    DEFAULT_GATEWAY_REPLICAS
                }),
                selector,
                template,
                ..Default::default()
            }),
            ..Default::default()
        }),
        Component::Agent => Workload::DaemonSet(DaemonSet {
            metadata: meta(&name),
            spec: Some(DaemonSetSpec {
                selector,
                template,
                ..Default::default()
            }),
            ..Default::default()
        }),
    };

    let mut bundle = WorkloadBundle {
        service_account: ServiceAccount {
            metadata: meta(&name),
            ..Default::default()
        },
        cluster_role: ClusterRole {
            metadata: object_meta(&name, None, component, owners, &name),
            rules: Some(cluster_role_rules(signal, component)),
            ..Default::default()
        },
        cluster_role_binding: ClusterRoleBinding {
            metadata: object_meta(&name, None, component, owners, &name),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.clone(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }]),
        },
        config_maps,
        secrets,
        services: build_services(&name, namespace, signal, component, owners),
        network_policy: build_network_policy(&name, namespace, signal, component, owners),
        workload,
        name,
        namespace: namespace.to_string(),
        signal,
        component,
    };
    let checksum = bundle_checksum(&bundle)?;
    bundle
        .workload
        .metadata_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(BUNDLE_CHECKSUM_ANNOTATION.to_string(), checksum);
    Ok(bundle)
}

async fn apply<K>(api: &Api<K>, object: &K) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    let name = object
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingField("metadata.name"))?;
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await?;
    Ok(())
}

/// Apply every object of the bundle with server-side apply
#[instrument(skip(client, bundle), fields(name = %bundle.name, namespace = %bundle.namespace))]
pub async fn apply_bundle(client: &Client, bundle: &WorkloadBundle) -> Result<()> {
    let ns = bundle.namespace.as_str();

    let live = match &bundle.workload {
        Workload::Deployment(_) => Api::<Deployment>::namespaced(client.clone(), ns)
            .get_opt(&bundle.name)
            .await?
            .map(|d| d.metadata),
        Workload::DaemonSet(_) => Api::<DaemonSet>::namespaced(client.clone(), ns)
            .get_opt(&bundle.name)
            .await?
            .map(|d| d.metadata),
    };
    if bundle.is_applied(live.as_ref()) {
        debug!("{} {}/{} unchanged", bundle.component.workload(), ns, bundle.name);
        return Ok(());
    }

    apply(&Api::<ServiceAccount>::namespaced(client.clone(), ns), &bundle.service_account).await?;
    apply(&Api::<ClusterRole>::all(client.clone()), &bundle.cluster_role).await?;
    apply(&Api::<ClusterRoleBinding>::all(client.clone()), &bundle.cluster_role_binding).await?;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
    for cm in &bundle.config_maps {
        apply(&config_maps, cm).await?;
    }
    let secrets: Api<Secret> = Api::namespaced(client.clone(), ns);
    for secret in &bundle.secrets {
        apply(&secrets, secret).await?;
    }
    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    for service in &bundle.services {
        apply(&services, service).await?;
    }
    apply(&Api::<NetworkPolicy>::namespaced(client.clone(), ns), &bundle.network_policy).await?;

    match &bundle.workload {
        Workload::Deployment(deployment) => {
            apply(&Api::<Deployment>::namespaced(client.clone(), ns), deployment).await?
        }
        Workload::DaemonSet(daemonset) => {
            apply(&Api::<DaemonSet>::namespaced(client.clone(), ns), daemonset).await?
        }
    }

    debug!("{} {}/{} applied", bundle.component.workload(), ns, bundle.name);
    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Delete every object a workload bundle may consist of
///
/// Objects already gone are skipped.
#[instrument(skip(client))]
pub async fn delete_bundle(client: &Client, name: &str, namespace: &str) -> Result<()> {
    let names = bundle_object_names(name);
    let mut deleted = 0;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    deleted += delete_ignoring_missing(&deployments, &names.workload).await? as usize;
    deleted += delete_ignoring_missing(&daemonsets, &names.workload).await? as usize;

    let network_policies: Api<NetworkPolicy> = Api::namespaced(client.clone(), namespace);
    deleted += delete_ignoring_missing(&network_policies, name).await? as usize;

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    for service in &names.services {
        deleted += delete_ignoring_missing(&services, service).await? as usize;
    }
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    for secret in &names.secrets {
        deleted += delete_ignoring_missing(&secrets, secret).await? as usize;
    }
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    for cm in &names.config_maps {
        deleted += delete_ignoring_missing(&config_maps, cm).await? as usize;
    }

    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    deleted += delete_ignoring_missing(&bindings, name).await? as usize;
    let roles: Api<ClusterRole> = Api::all(client.clone());
    deleted += delete_ignoring_missing(&roles, name).await? as usize;
    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    deleted += delete_ignoring_missing(&accounts, name).await? as usize;

    if deleted > 0 {
        info!("Deleted {} objects of workload {}/{}", deleted, namespace, name);
    }
    Ok(())
}

/// Whether the gateway Service of `signal` exists
pub async fn gateway_service_exists(client: &Client, signal: Signal, namespace: &str) -> Result<bool> {
    let Some(name) = Component::Gateway.workload_name(signal) else {
        return Ok(false);
    };
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(&name).await?.is_some())
}
