//! Metric agent collector configuration
//!
//! The agent runs on every node, collects the node-local sources enabled
//! by any reconcilable pipeline, stamps each data point with its input
//! source and forwards everything to the metric gateway. Per-pipeline
//! source and namespace selection happens in the gateway.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use super::{
    batch_processor, env_ref, memory_limiter, BuildOptions, CollectorConfig, ENV_NODE_NAME,
    INPUT_SOURCE_ATTRIBUTE, OTLP_GRPC_PORT,
};
use crate::crd::{MetricPipeline, MetricSource};
use crate::error::Result;

pub const EXPORTER_ID: &str = "otlp";

/// Diagnostic series every prometheus scrape produces
const DIAGNOSTIC_METRICS: [&str; 5] = [
    "up",
    "scrape_duration_seconds",
    "scrape_samples_scraped",
    "scrape_samples_post_metric_relabeling",
    "scrape_series_added",
];

/// Sources enabled by at least one pipeline, in a fixed order
pub fn enabled_sources(pipelines: &[&MetricPipeline]) -> BTreeSet<MetricSource> {
    pipelines
        .iter()
        .flat_map(|p| {
            MetricSource::ALL
                .into_iter()
                .filter(|s| p.spec.input.is_enabled(*s))
        })
        .collect()
}

fn kubelet_stats_receiver() -> Value {
    json!({
        "collection_interval": "30s",
        "auth_type": "serviceAccount",
        "endpoint": format!("https://{}:10250", env_ref(ENV_NODE_NAME)),
        "insecure_skip_verify": true,
        "metric_groups": ["container", "pod"],
    })
}

fn app_pods_receiver() -> Value {
    json!({
        "config": {
            "scrape_configs": [{
                "job_name": "app-pods",
                "scrape_interval": "30s",
                "kubernetes_sd_configs": [{
                    "role": "pod",
                    "selectors": [{
                        "role": "pod",
                        "field": format!("spec.nodeName={}", env_ref(ENV_NODE_NAME)),
                    }],
                }],
                "relabel_configs": [
                    {
                        "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_scrape"],
                        "regex": "true",
                        "action": "keep",
                    },
                    {
                        "source_labels": ["__meta_kubernetes_pod_phase"],
                        "regex": "Pending|Succeeded|Failed",
                        "action": "drop",
                    },
                    {
                        "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_path"],
                        "regex": "(.+)",
                        "target_label": "__metrics_path__",
                        "action": "replace",
                    },
                    {
                        "source_labels": [
                            "__address__",
                            "__meta_kubernetes_pod_annotation_prometheus_io_port",
                        ],
                        "regex": "([^:]+)(?::\\d+)?;(\\d+)",
                        "replacement": "$$1:$$2",
                        "target_label": "__address__",
                        "action": "replace",
                    },
                ],
            }]
        }
    })
}

fn istio_receiver() -> Value {
    json!({
        "config": {
            "scrape_configs": [{
                "job_name": "istio-proxy",
                "scrape_interval": "30s",
                "metrics_path": "/stats/prometheus",
                "kubernetes_sd_configs": [{
                    "role": "pod",
                    "selectors": [{
                        "role": "pod",
                        "field": format!("spec.nodeName={}", env_ref(ENV_NODE_NAME)),
                    }],
                }],
                "relabel_configs": [
                    {
                        "source_labels": ["__meta_kubernetes_pod_container_name"],
                        "regex": "istio-proxy",
                        "action": "keep",
                    },
                    {
                        "source_labels": ["__meta_kubernetes_pod_container_port_name"],
                        "regex": "http-envoy-prom",
                        "action": "keep",
                    },
                ],
                "metric_relabel_configs": [{
                    "source_labels": ["__name__"],
                    "regex": "istio_.*",
                    "action": "keep",
                }],
            }]
        }
    })
}

fn insert_input_source(source: MetricSource) -> Value {
    json!({
        "attributes": [{
            "action": "insert",
            "key": INPUT_SOURCE_ATTRIBUTE,
            "value": source.as_str(),
        }]
    })
}

fn drop_diagnostic_metrics() -> Value {
    let conditions: Vec<String> = DIAGNOSTIC_METRICS
        .iter()
        .map(|name| format!("name == \"{name}\""))
        .collect();
    json!({
        "error_mode": "ignore",
        "metrics": {"metric": conditions},
    })
}

fn gateway_exporter(namespace: &str) -> Value {
    json!({
        "endpoint": format!(
            "telemetry-metric-gateway.{namespace}.svc.cluster.local:{OTLP_GRPC_PORT}"
        ),
        "tls": {"insecure": true},
        "sending_queue": {"enabled": true, "queue_size": 512},
        "retry_on_failure": {
            "enabled": true,
            "initial_interval": "5s",
            "max_interval": "30s",
            "max_elapsed_time": "300s",
        },
    })
}

/// Build the agent configuration for the reconcilable pipelines
///
/// Only pipelines requiring the agent contribute; with none enabling a
/// node-local source, the document has no service pipelines.
pub fn build(pipelines: &[&MetricPipeline], opts: &BuildOptions) -> Result<CollectorConfig> {
    let mut config = CollectorConfig::base(opts);

    for source in enabled_sources(pipelines) {
        let pipeline = format!("metrics/{}", source.as_str());
        match source {
            MetricSource::Runtime => {
                config.add_receiver(&pipeline, "kubeletstats", kubelet_stats_receiver());
                config.add_processor(&pipeline, "memory_limiter", memory_limiter());
            }
            MetricSource::Prometheus => {
                config.add_receiver(&pipeline, "prometheus/app-pods", app_pods_receiver());
                config.add_processor(&pipeline, "memory_limiter", memory_limiter());
                config.add_processor(
                    &pipeline,
                    "filter/drop-diagnostic-metrics",
                    drop_diagnostic_metrics(),
                );
            }
            MetricSource::Istio => {
                config.add_receiver(&pipeline, "prometheus/istio", istio_receiver());
                config.add_processor(&pipeline, "memory_limiter", memory_limiter());
            }
        }
        config.add_processor(
            &pipeline,
            &format!("resource/insert-input-source-{}", source.as_str()),
            insert_input_source(source),
        );
        config.add_processor(&pipeline, "batch", batch_processor());
        config.add_exporter(&pipeline, EXPORTER_ID, gateway_exporter(&opts.namespace));
    }

    Ok(config)
}
