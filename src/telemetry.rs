//! Operator self-tracing
//!
//! Builds the OpenTelemetry layer that exports the operator's own spans
//! over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. The collectors the
//! operator manages are configured elsewhere; this only concerns the
//! operator process itself.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_sdk::{runtime, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

/// Service name reported on exported spans
pub const SERVICE_NAME: &str = "telemetry-operator";

/// Environment variable that enables span export
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Build the OpenTelemetry tracing layer.
///
/// Returns `None` when no OTLP endpoint is configured or the exporter
/// pipeline cannot be installed; the operator keeps logging to stdout in
/// both cases.
pub fn init_telemetry<S>() -> Option<OpenTelemetryLayer<S, Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let endpoint = std::env::var(OTLP_ENDPOINT_ENV).ok()?;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint.clone());

    let trace_config = opentelemetry_sdk::trace::config().with_resource(Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]));

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace_config)
        .install_batch(runtime::Tokio)
    {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            eprintln!("Failed to install OTLP exporter for {endpoint}: {e}");
            None
        }
    }
}

/// Flush pending spans before the process exits
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
