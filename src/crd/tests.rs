//! Unit tests for the pipeline resource definitions
//!
//! Covers deserialization defaults and the signal-independent view that
//! the controllers rely on.

#[cfg(test)]
mod pipeline_resources {
    use kube::CustomResourceExt;
    use serde_json::json;

    use crate::crd::{
        LogPipeline, LogPipelineSpec, MetricPipeline, MetricPipelineSpec, Signal, Telemetry,
        TelemetryPipeline, TelemetrySpec, TracePipeline, TracePipelineSpec,
    };

    fn log_pipeline(spec: serde_json::Value) -> LogPipeline {
        let spec: LogPipelineSpec = serde_json::from_value(spec).unwrap();
        LogPipeline::new("app-logs", spec)
    }

    fn metric_pipeline(spec: serde_json::Value) -> MetricPipeline {
        let spec: MetricPipelineSpec = serde_json::from_value(spec).unwrap();
        MetricPipeline::new("app-metrics", spec)
    }

    #[test]
    fn test_crds_are_cluster_scoped() {
        assert_eq!(LogPipeline::crd().spec.scope, "Cluster");
        assert_eq!(MetricPipeline::crd().spec.scope, "Cluster");
        assert_eq!(TracePipeline::crd().spec.scope, "Cluster");
        assert_eq!(Telemetry::crd().spec.scope, "Cluster");
    }

    #[test]
    fn test_crd_names() {
        assert_eq!(
            LogPipeline::crd_name(),
            "logpipelines.telemetry.kube-ops.io"
        );
        assert_eq!(
            Telemetry::crd_name(),
            "telemetries.telemetry.kube-ops.io"
        );
    }

    #[test]
    fn test_log_http_output_requires_agent_only() {
        let pipeline = log_pipeline(json!({
            "output": {"http": {"host": {"value": "logs.example.com"}}}
        }));

        assert_eq!(<LogPipeline as TelemetryPipeline>::SIGNAL, Signal::Logs);
        assert!(pipeline.requires_agent());
        assert!(!pipeline.requires_gateway());
        assert!(!pipeline.unsupported_mode());
        assert_eq!(pipeline.spec.output.defined_count(), 1);
    }

    #[test]
    fn test_log_otlp_output_requires_gateway_only() {
        let pipeline = log_pipeline(json!({
            "output": {"otlp": {"endpoint": {"value": "http://collector:4317"}}}
        }));

        assert!(pipeline.requires_gateway());
        assert!(!pipeline.requires_agent());
    }

    #[test]
    fn test_log_custom_fragments_set_unsupported_mode() {
        let pipeline = log_pipeline(json!({
            "filters": [{"custom": "Name grep\nRegex log foo"}],
            "output": {"http": {"host": {"value": "logs.example.com"}}}
        }));

        assert!(pipeline.unsupported_mode());
        let patch = pipeline.status_patch(&[]);
        assert_eq!(patch["unsupportedMode"], json!(true));
    }

    #[test]
    fn test_log_secret_refs_are_deduplicated() {
        let pipeline = log_pipeline(json!({
            "output": {"http": {
                "host": {"valueFrom": {"secretKeyRef": {"name": "creds", "namespace": "default", "key": "host"}}},
                "user": {"valueFrom": {"secretKeyRef": {"name": "creds", "namespace": "default", "key": "user"}}},
                "password": {"valueFrom": {"secretKeyRef": {"name": "creds", "namespace": "default", "key": "user"}}}
            }}
        }));

        assert_eq!(pipeline.secret_refs().len(), 2);
        assert!(pipeline.references_secret("creds", "default"));
        assert!(!pipeline.references_secret("creds", "other"));
    }

    #[test]
    fn test_metric_agent_required_for_node_inputs() {
        let otlp_only = metric_pipeline(json!({
            "output": {"otlp": {"endpoint": {"value": "http://collector:4317"}}}
        }));
        assert!(!otlp_only.requires_agent());
        assert!(otlp_only.requires_gateway());

        let runtime = metric_pipeline(json!({
            "input": {"runtime": {"enabled": true}},
            "output": {"otlp": {"endpoint": {"value": "http://collector:4317"}}}
        }));
        assert!(runtime.requires_agent());
    }

    #[test]
    fn test_trace_pipeline_never_needs_agent() {
        let spec: TracePipelineSpec = serde_json::from_value(json!({
            "output": {"otlp": {
                "endpoint": {"value": "https://collector:4317"},
                "tls": {"cert": {"value": "c"}, "key": {"value": "k"}}
            }}
        }))
        .unwrap();
        let pipeline = TracePipeline::new("traces", spec);

        assert!(!pipeline.requires_agent());
        assert!(pipeline.tls_material().cert.is_some());
        assert!(pipeline.tls_material().ca.is_none());
    }

    #[test]
    fn test_telemetry_static_scaling() {
        let spec: TelemetrySpec = serde_json::from_value(json!({
            "trace": {"gateway": {"scaling": {"type": "Static", "static": {"replicas": 4}}}},
            "enrichments": {"cluster": {"name": "prod-eu"}, "extractPodLabels": [{"key": "app"}]}
        }))
        .unwrap();

        assert_eq!(spec.static_gateway_replicas(Signal::Traces), Some(4));
        assert_eq!(spec.static_gateway_replicas(Signal::Metrics), None);
        assert_eq!(spec.cluster_name(), Some("prod-eu"));
        assert_eq!(spec.pod_label_rules().len(), 1);
    }
}
