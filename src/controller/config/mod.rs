//! Collector configuration rendering
//!
//! Turns the reconcilable pipelines of a signal into the configuration
//! documents of its gateway and agent, plus the environment values those
//! documents reference. Secret values never appear in a document; they
//! travel through the workload's env Secret and `${env:...}` references.
//!
//! Output is deterministic: maps are ordered and pipelines are rendered
//! sorted by name, so identical inputs always hash identically.

pub mod fluent_bit;
pub mod gateway;
pub mod metric_agent;
pub mod otlp;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::crd::{PodLabel, Signal};
use crate::error::{Error, Result};

/// Environment values referenced by a rendered document
pub type EnvVars = BTreeMap<String, String>;

pub const ENV_POD_IP: &str = "MY_POD_IP";
pub const ENV_NODE_NAME: &str = "MY_NODE_NAME";

pub const OTLP_GRPC_PORT: u16 = 4317;
pub const OTLP_HTTP_PORT: u16 = 4318;
pub const COLLECTOR_METRICS_PORT: u16 = 8888;
pub const HEALTH_CHECK_PORT: u16 = 13133;

/// Resource attribute the metric agent stamps on data so the gateway
/// can tell the input sources apart
pub const INPUT_SOURCE_ATTRIBUTE: &str = "telemetry.input.source";

/// Resource attribute carrying the cluster name
pub const CLUSTER_NAME_ATTRIBUTE: &str = "k8s.cluster.name";

/// Total batches kept in memory across all exporters of a collector
pub const MAX_QUEUE_SIZE: usize = 256;

/// Cluster-wide inputs of the builders
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    pub cluster_name: Option<String>,
    pub pod_labels: Vec<PodLabel>,
    pub log_level: String,
    /// Namespace of the managed workloads
    pub namespace: String,
}

impl BuildOptions {
    fn log_level(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }
}

/// Stable id of a pipeline within the collector configuration
pub fn pipeline_alias(signal: Signal, name: &str) -> String {
    format!("{}/{}", signal.as_str(), name)
}

/// Make a name usable as part of an environment variable
///
/// Hyphens become underscores. Any other character that has to be
/// replaced makes the mapping lossy, so a hash of the raw name is
/// appended; `team-a` and `team.a` never share a variable.
pub fn env_var_suffix(name: &str) -> String {
    let mut lossy = false;
    let mut suffix: String = name
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c.to_ascii_uppercase(),
            '-' => '_',
            _ => {
                lossy = true;
                '_'
            }
        })
        .collect();
    if lossy {
        let digest = Sha256::digest(name.as_bytes());
        suffix.push('_');
        suffix.push_str(&hex::encode_upper(&digest[..4]));
    }
    suffix
}

/// Add the env values of one pipeline to those of a whole workload
///
/// Two pipelines may only share a variable when they agree on its value.
pub fn merge_env(env: &mut EnvVars, values: EnvVars, pipeline: &str) -> Result<()> {
    for (key, value) in values {
        match env.get(&key) {
            Some(existing) if *existing != value => {
                return Err(Error::ConfigError(format!(
                    "environment variable {key} of pipeline {pipeline} clashes with another pipeline"
                )));
            }
            _ => {
                env.insert(key, value);
            }
        }
    }
    Ok(())
}

/// Reference to an environment variable from within a collector config
pub fn env_ref(name: &str) -> String {
    format!("${{env:{name}}}")
}

/// Per-exporter queue size for `pipeline_count` exporters
pub fn queue_size(pipeline_count: usize) -> usize {
    MAX_QUEUE_SIZE / pipeline_count.max(1)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ServicePipeline {
    pub receivers: Vec<String>,
    pub processors: Vec<String>,
    pub exporters: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Service {
    pub pipelines: BTreeMap<String, ServicePipeline>,
    pub telemetry: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
}

/// OpenTelemetry Collector configuration document
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CollectorConfig {
    pub extensions: BTreeMap<String, Value>,
    pub receivers: BTreeMap<String, Value>,
    pub processors: BTreeMap<String, Value>,
    pub exporters: BTreeMap<String, Value>,
    pub service: Service,
}

impl CollectorConfig {
    /// Base document shared by every collector this operator runs
    pub fn base(opts: &BuildOptions) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(
            "health_check".to_string(),
            json!({ "endpoint": format!("{}:{}", env_ref(ENV_POD_IP), HEALTH_CHECK_PORT) }),
        );
        extensions.insert(
            "pprof".to_string(),
            json!({ "endpoint": "127.0.0.1:1777" }),
        );

        Self {
            extensions,
            service: Service {
                extensions: vec!["health_check".to_string(), "pprof".to_string()],
                telemetry: json!({
                    "metrics": {
                        "readers": [{
                            "pull": {"exporter": {"prometheus": {
                                "host": env_ref(ENV_POD_IP),
                                "port": COLLECTOR_METRICS_PORT,
                            }}}
                        }]
                    },
                    "logs": {"level": opts.log_level(), "encoding": "json"},
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Append a component to a service pipeline, registering its config
    /// on first use
    pub fn add_processor(&mut self, pipeline: &str, id: &str, config: Value) {
        self.processors.entry(id.to_string()).or_insert(config);
        self.service
            .pipelines
            .entry(pipeline.to_string())
            .or_default()
            .processors
            .push(id.to_string());
    }

    pub fn add_receiver(&mut self, pipeline: &str, id: &str, config: Value) {
        self.receivers.entry(id.to_string()).or_insert(config);
        self.service
            .pipelines
            .entry(pipeline.to_string())
            .or_default()
            .receivers
            .push(id.to_string());
    }

    pub fn add_exporter(&mut self, pipeline: &str, id: &str, config: Value) {
        self.exporters.insert(id.to_string(), config);
        self.service
            .pipelines
            .entry(pipeline.to_string())
            .or_default()
            .exporters
            .push(id.to_string());
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

pub fn memory_limiter() -> Value {
    json!({
        "check_interval": "1s",
        "limit_percentage": 75,
        "spike_limit_percentage": 15,
    })
}

pub fn batch_processor() -> Value {
    json!({
        "send_batch_size": 512,
        "timeout": "10s",
        "send_batch_max_size": 512,
    })
}

/// Pod metadata enrichment, including the configured pod label rules
pub fn k8s_attributes(pod_labels: &[PodLabel]) -> Value {
    let labels: Vec<Value> = pod_labels
        .iter()
        .filter_map(|rule| {
            if !rule.key.is_empty() {
                Some(json!({
                    "from": "pod",
                    "key": rule.key,
                    "tag_name": format!("k8s.pod.label.{}", rule.key),
                }))
            } else if !rule.key_prefix.is_empty() {
                Some(json!({
                    "from": "pod",
                    "key_regex": format!("({}.*)", regex_escape(&rule.key_prefix)),
                    "tag_name": "k8s.pod.label.$$1",
                }))
            } else {
                None
            }
        })
        .collect();

    json!({
        "auth_type": "serviceAccount",
        "passthrough": false,
        "extract": {
            "metadata": [
                "k8s.pod.name",
                "k8s.node.name",
                "k8s.namespace.name",
                "k8s.deployment.name",
                "k8s.statefulset.name",
                "k8s.daemonset.name",
                "k8s.cronjob.name",
                "k8s.job.name",
            ],
            "labels": labels,
        },
        "pod_association": [
            {"sources": [{"from": "resource_attribute", "name": "k8s.pod.ip"}]},
            {"sources": [{"from": "resource_attribute", "name": "k8s.pod.uid"}]},
            {"sources": [{"from": "connection"}]},
        ],
    })
}

/// Resource processor attaching the cluster name to all data
pub fn insert_cluster_name(cluster_name: &str) -> Value {
    json!({
        "attributes": [{
            "action": "insert",
            "key": CLUSTER_NAME_ATTRIBUTE,
            "value": cluster_name,
        }]
    })
}

fn regex_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// OTTL condition matching a namespace list
pub(crate) fn namespace_condition(namespaces: &[String]) -> String {
    let parts: Vec<String> = namespaces
        .iter()
        .map(|ns| format!("resource.attributes[\"k8s.namespace.name\"] == \"{ns}\""))
        .collect();
    if parts.len() == 1 {
        parts[0].clone()
    } else {
        format!("({})", parts.join(" or "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_alias() {
        assert_eq!(pipeline_alias(Signal::Traces, "foo"), "traces/foo");
        assert_eq!(pipeline_alias(Signal::Logs, "bar-baz"), "logs/bar-baz");
    }

    #[test]
    fn test_env_var_suffix() {
        assert_eq!(env_var_suffix("my-pipeline-v2"), "MY_PIPELINE_V2");
        assert_eq!(env_var_suffix("my-pipeline.v2"), "MY_PIPELINE_V2_AA9152DA");
        assert_eq!(env_var_suffix("X-Token"), "X_TOKEN");
    }

    #[test]
    fn test_env_var_suffix_keeps_names_apart() {
        let names = ["team-a", "team.a", "team_a", "team a", "team/a"];
        let suffixes: std::collections::BTreeSet<String> =
            names.iter().map(|n| env_var_suffix(n)).collect();
        assert_eq!(suffixes.len(), names.len());
    }

    #[test]
    fn test_queue_size_is_shared() {
        assert_eq!(queue_size(1), 256);
        assert_eq!(queue_size(3), 85);
        assert_eq!(queue_size(0), 256);
    }

    #[test]
    fn test_prefix_label_rule_is_regex() {
        let config = k8s_attributes(&[
            PodLabel {
                key: "app".to_string(),
                key_prefix: String::new(),
            },
            PodLabel {
                key: String::new(),
                key_prefix: "app.kubernetes.io".to_string(),
            },
        ]);
        let labels = config["extract"]["labels"].as_array().unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0]["key"], "app");
        assert_eq!(labels[1]["key_regex"], "(app\\.kubernetes\\.io.*)");
    }

    #[test]
    fn test_namespace_condition() {
        assert_eq!(
            namespace_condition(&["a".to_string()]),
            "resource.attributes[\"k8s.namespace.name\"] == \"a\""
        );
        assert!(namespace_condition(&["a".to_string(), "b".to_string()]).contains(" or "));
    }
}
