//! Gateway collector configuration
//!
//! One OTLP receiver is shared by all pipelines of the signal. Each
//! pipeline gets its own service pipeline, keyed by its alias, with the
//! shared enrichment processors, its own input filters and its own
//! exporter.

use kube::ResourceExt;
use serde_json::{json, Map, Value};

use super::{
    batch_processor, env_ref, insert_cluster_name, k8s_attributes, memory_limiter, merge_env,
    namespace_condition, otlp, pipeline_alias, queue_size, BuildOptions, CollectorConfig,
    EnvVars, ENV_POD_IP, INPUT_SOURCE_ATTRIBUTE, OTLP_GRPC_PORT, OTLP_HTTP_PORT,
};
use crate::controller::secrets::ResolvedValues;
use crate::crd::{
    LogPipeline, MetricPipeline, MetricSource, NamespaceSelector, Signal, TelemetryPipeline,
    TracePipeline,
};
use crate::error::Result;

/// Per-pipeline processors a signal adds on top of the shared chain
pub trait GatewayFilters: TelemetryPipeline {
    /// Drop conditions for this pipeline, in OTTL
    fn drop_conditions(&self) -> Vec<String> {
        Vec::new()
    }
}

impl GatewayFilters for TracePipeline {}

fn source_condition(source: &str) -> String {
    format!("resource.attributes[\"{INPUT_SOURCE_ATTRIBUTE}\"] == \"{source}\"")
}

/// Data pushed directly to the gateway carries no input source
fn otlp_source_condition() -> String {
    format!("resource.attributes[\"{INPUT_SOURCE_ATTRIBUTE}\"] == nil")
}

/// Conditions dropping data outside the selected namespaces. With a
/// `source`, only data of that source is affected.
fn namespace_drop_conditions(
    source: Option<&str>,
    selector: Option<&NamespaceSelector>,
) -> Vec<String> {
    let Some(selector) = selector else {
        return Vec::new();
    };
    let scoped = |condition: String| match source {
        Some(source) => format!("{source} and {condition}"),
        None => condition,
    };
    let mut conditions = Vec::new();
    if !selector.include.is_empty() {
        conditions.push(scoped(format!(
            "not {}",
            namespace_condition(&selector.include)
        )));
    }
    if !selector.exclude.is_empty() {
        conditions.push(scoped(namespace_condition(&selector.exclude)));
    }
    conditions
}

impl GatewayFilters for MetricPipeline {
    fn drop_conditions(&self) -> Vec<String> {
        let input = &self.spec.input;
        let mut conditions = Vec::new();

        for source in MetricSource::ALL {
            let condition = source_condition(source.as_str());
            if !input.is_enabled(source) {
                conditions.push(condition);
                continue;
            }
            let selector = input.source(source).and_then(|s| s.namespaces.as_ref());
            conditions.extend(namespace_drop_conditions(Some(&condition), selector));
        }

        if input.otlp_enabled() {
            let selector = input.otlp.as_ref().and_then(|o| o.namespaces.as_ref());
            let source = otlp_source_condition();
            conditions.extend(namespace_drop_conditions(Some(&source), selector));
        } else {
            conditions.push(otlp_source_condition());
        }
        conditions
    }
}

impl GatewayFilters for LogPipeline {
    fn drop_conditions(&self) -> Vec<String> {
        let otlp_enabled = self
            .spec
            .input
            .otlp
            .as_ref()
            .map(|o| !o.disabled)
            .unwrap_or(true);
        if !otlp_enabled {
            return vec!["true".to_string()];
        }
        namespace_drop_conditions(None, self.spec.otlp_namespaces())
    }
}

fn filter_processor(signal: Signal, conditions: Vec<String>) -> Value {
    let context = match signal {
        Signal::Metrics => "metric",
        Signal::Logs => "log_record",
        Signal::Traces => "span",
    };
    let mut body = Map::new();
    body.insert(context.to_string(), json!(conditions));
    let mut processor = Map::new();
    processor.insert("error_mode".to_string(), json!("ignore"));
    processor.insert(signal.as_str().to_string(), Value::Object(body));
    Value::Object(processor)
}

fn otlp_receiver() -> Value {
    json!({
        "protocols": {
            "grpc": {"endpoint": format!("{}:{}", env_ref(ENV_POD_IP), OTLP_GRPC_PORT)},
            "http": {"endpoint": format!("{}:{}", env_ref(ENV_POD_IP), OTLP_HTTP_PORT)},
        }
    })
}

/// Build the gateway configuration for the reconcilable pipelines
pub fn build<P: GatewayFilters>(
    pipelines: &[(&P, &ResolvedValues)],
    opts: &BuildOptions,
) -> Result<(CollectorConfig, EnvVars)> {
    let mut config = CollectorConfig::base(opts);
    let mut env = EnvVars::new();

    let mut sorted: Vec<&(&P, &ResolvedValues)> = pipelines
        .iter()
        .filter(|(p, _)| p.requires_gateway())
        .collect();
    sorted.sort_by_key(|(p, _)| p.name_any());
    let queue = queue_size(sorted.len());

    for (pipeline, values) in sorted {
        let name = pipeline.name_any();
        let alias = pipeline_alias(P::SIGNAL, &name);
        let Some(output) = pipeline.otlp_output() else {
            continue;
        };

        config.add_receiver(&alias, "otlp", otlp_receiver());
        config.add_processor(&alias, "memory_limiter", memory_limiter());
        config.add_processor(&alias, "k8sattributes", k8s_attributes(&opts.pod_labels));
        if let Some(cluster) = opts.cluster_name.as_deref() {
            config.add_processor(
                &alias,
                "resource/insert-cluster-name",
                insert_cluster_name(cluster),
            );
        }

        let conditions = pipeline.drop_conditions();
        if !conditions.is_empty() {
            config.add_processor(
                &alias,
                &format!("filter/{name}-input"),
                filter_processor(P::SIGNAL, conditions),
            );
        }

        config.add_processor(&alias, "batch", batch_processor());

        let (exporter, exporter_env) = otlp::exporter(output, &name, values, queue);
        config.add_exporter(&alias, &otlp::exporter_id(output, &name), exporter);
        merge_env(&mut env, exporter_env, &name)?;
    }

    Ok((config, env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Header, HttpOutput, LogInput, LogOutput, LogPipelineSpec, MetricInput, MetricOutput,
        MetricPipelineSpec, MetricSourceInput, OtlpInput, OtlpOutput, TraceOutput,
        TracePipelineSpec, ValueType,
    };

    fn trace(name: &str) -> TracePipeline {
        TracePipeline::new(
            name,
            TracePipelineSpec {
                output: TraceOutput {
                    otlp: OtlpOutput {
                        endpoint: ValueType::inline("http://collector.example:4317"),
                        ..Default::default()
                    },
                },
            },
        )
    }

    fn opts() -> BuildOptions {
        BuildOptions {
            namespace: "telemetry-system".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_each_pipeline_gets_its_alias() {
        let values = ResolvedValues::default();
        let a = trace("a");
        let b = trace("b");
        let (config, env) = build(&[(&a, &values), (&b, &values)], &opts()).unwrap();

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("traces/a"));
        assert!(yaml.contains("traces/b"));
        assert_eq!(config.receivers.len(), 1);
        assert_eq!(config.exporters["otlp/a"]["sending_queue"]["queue_size"], 128);
        assert!(env.contains_key("OTLP_ENDPOINT_A"));
        assert!(!yaml.contains("collector.example"));
    }

    #[test]
    fn test_similar_pipeline_names_keep_their_endpoints_apart() {
        let values = ResolvedValues::default();
        let dashed = trace("team-a");
        let mut dotted = trace("team.a");
        dotted.spec.output.otlp.endpoint = ValueType::inline("http://other.example:4317");
        let (_, env) = build(&[(&dashed, &values), (&dotted, &values)], &opts()).unwrap();

        let endpoints: Vec<_> = env
            .iter()
            .filter(|(k, _)| k.starts_with("OTLP_ENDPOINT_"))
            .collect();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(env["OTLP_ENDPOINT_TEAM_A"], "http://collector.example:4317");
        assert!(endpoints
            .iter()
            .any(|(k, v)| k.starts_with("OTLP_ENDPOINT_TEAM_A_") && *v == "http://other.example:4317"));
    }

    #[test]
    fn test_clashing_header_variables_are_rejected() {
        let values = ResolvedValues::default();
        let mut a = trace("a");
        a.spec.output.otlp.headers = vec![Header {
            name: "b-c".to_string(),
            value: ValueType::inline("one"),
            prefix: String::new(),
        }];
        let mut ab = trace("a-b");
        ab.spec.output.otlp.headers = vec![Header {
            name: "c".to_string(),
            value: ValueType::inline("two"),
            prefix: String::new(),
        }];
        let err = build(&[(&a, &values), (&ab, &values)], &opts()).unwrap_err();
        assert!(err.to_string().contains("HEADER_A_B_C"));
    }

    #[test]
    fn test_output_is_independent_of_input_order() {
        let values = ResolvedValues::default();
        let a = trace("a");
        let b = trace("b");
        let (first, _) = build(&[(&a, &values), (&b, &values)], &opts()).unwrap();
        let (second, _) = build(&[(&b, &values), (&a, &values)], &opts()).unwrap();
        assert_eq!(first.to_yaml().unwrap(), second.to_yaml().unwrap());
    }

    #[test]
    fn test_cluster_name_enrichment() {
        let values = ResolvedValues::default();
        let a = trace("a");
        let options = BuildOptions {
            cluster_name: Some("prod-eu".to_string()),
            ..opts()
        };
        let (config, _) = build(&[(&a, &values)], &options).unwrap();

        assert!(config.processors.contains_key("resource/insert-cluster-name"));
        assert_eq!(
            config.service.pipelines["traces/a"].processors,
            vec!["memory_limiter", "k8sattributes", "resource/insert-cluster-name", "batch"]
        );
    }

    #[test]
    fn test_metric_pipeline_drops_disabled_sources() {
        let pipeline = MetricPipeline::new(
            "m",
            MetricPipelineSpec {
                input: MetricInput {
                    runtime: Some(MetricSourceInput {
                        enabled: true,
                        namespaces: Some(NamespaceSelector {
                            include: vec!["shop".to_string()],
                            exclude: vec![],
                        }),
                    }),
                    ..Default::default()
                },
                output: MetricOutput {
                    otlp: OtlpOutput {
                        endpoint: ValueType::inline("http://collector.example:4317"),
                        ..Default::default()
                    },
                },
            },
        );

        let conditions = pipeline.drop_conditions();
        assert!(conditions.contains(&source_condition("prometheus")));
        assert!(conditions.contains(&source_condition("istio")));
        assert!(!conditions.contains(&source_condition("runtime")));
        assert!(conditions
            .iter()
            .any(|c| c.starts_with(&source_condition("runtime")) && c.contains("\"shop\"")));

        let values = ResolvedValues::default();
        let (config, _) = build(&[(&pipeline, &values)], &opts()).unwrap();
        assert!(config.processors["filter/m-input"]["metrics"]["metric"].is_array());
    }

    #[test]
    fn test_log_pipeline_filters_otlp_namespaces() {
        let pipeline = LogPipeline::new(
            "l",
            LogPipelineSpec {
                input: LogInput {
                    otlp: Some(OtlpInput {
                        disabled: false,
                        namespaces: Some(NamespaceSelector {
                            include: vec![],
                            exclude: vec!["kube-system".to_string()],
                        }),
                    }),
                    ..Default::default()
                },
                output: LogOutput {
                    otlp: Some(OtlpOutput {
                        endpoint: ValueType::inline("https://logs.example:4317"),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        assert_eq!(
            pipeline.drop_conditions(),
            vec![namespace_condition(&["kube-system".to_string()])]
        );

        let values = ResolvedValues::default();
        let (config, _) = build(&[(&pipeline, &values)], &opts()).unwrap();
        assert_eq!(
            config.processors["filter/l-input"]["logs"]["log_record"][0],
            namespace_condition(&["kube-system".to_string()])
        );
    }

    #[test]
    fn test_log_pipeline_without_otlp_output_is_skipped() {
        let pipeline = LogPipeline::new(
            "fb",
            LogPipelineSpec {
                output: LogOutput {
                    http: Some(HttpOutput {
                        host: ValueType::inline("logs.example"),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let values = ResolvedValues::default();
        let (config, env) = build(&[(&pipeline, &values)], &opts()).unwrap();
        assert!(config.service.pipelines.is_empty());
        assert!(env.is_empty());
    }
}
