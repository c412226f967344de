//! Prometheus metrics for the telemetry operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `telemetry_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `telemetry_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `telemetry_reconcilable_pipelines` (gauge): pipelines admitted into the configuration, per signal.
//! - `telemetry_status_writes_total` (counter): status subresource writes labeled by kind.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "tracepipeline"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error category, see `Error::metric_label`
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SignalLabels {
    pub signal: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 5ms .. ~164s across 16 buckets.
        Histogram::new(exponential_buckets(0.005, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILABLE_PIPELINES: Lazy<Family<SignalLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static STATUS_WRITES_TOTAL: Lazy<Family<KindLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "telemetry_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "telemetry_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "telemetry_reconcilable_pipelines",
        "Pipelines currently admitted into the generated configuration",
        RECONCILABLE_PIPELINES.clone(),
    );
    registry.register(
        "telemetry_status_writes_total",
        "Total number of status subresource writes",
        STATUS_WRITES_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_reconcilable_pipelines(signal: &str, count: i64) {
    let labels = SignalLabels {
        signal: signal.to_string(),
    };
    RECONCILABLE_PIPELINES.get_or_create(&labels).set(count);
}

pub fn inc_status_write(kind: &str) {
    let labels = KindLabels {
        kind: kind.to_string(),
    };
    STATUS_WRITES_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in the OpenMetrics text format
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
