//! Telemetry flow health from the self-monitor
//!
//! The self-monitor is a Prometheus instance scraping the collectors and
//! the Fluent Bit agent, exposing 5-minute rates of their counters plus
//! the agent's filesystem buffer usage. Every per-pipeline series carries
//! the `pipeline_name` label. It is sampled once per reconcile; there is
//! no background polling.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use super::conditions::{
    CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, CONDITION_STATUS_UNKNOWN,
    REASON_SELF_MON_ALL_DATA_DROPPED, REASON_SELF_MON_BUFFER_FILLING_UP,
    REASON_SELF_MON_CONFIG_NOT_GENERATED, REASON_SELF_MON_FLOW_HEALTHY,
    REASON_SELF_MON_GATEWAY_THROTTLING, REASON_SELF_MON_NO_CONSUMER_GATEWAY_THROTTLING,
    REASON_SELF_MON_NO_LOGS_DELIVERED, REASON_SELF_MON_PROBING_FAILED,
    REASON_SELF_MON_SOME_DATA_DROPPED,
};
use crate::crd::Signal;
use crate::error::{Error, Result};

/// Queue utilisation ratio above which the buffer counts as filling up
pub const BUFFER_FILLING_UP_RATIO: f64 = 0.8;

/// Fluent Bit filesystem buffer usage from which the buffer counts as in use
pub const FLUENT_BIT_BUFFER_IN_USE_BYTES: f64 = 300_000_000.0;
/// Fluent Bit filesystem buffer usage from which new chunks are dropped
pub const FLUENT_BIT_BUFFER_FULL_BYTES: f64 = 900_000_000.0;

pub const PIPELINE_LABEL: &str = "pipeline_name";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Verdict about one pipeline's data flow
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowHealth {
    Healthy,
    AllDataDropped,
    SomeDataDropped,
    BufferFillingUp,
    /// Logs are read but the agent delivers none of them
    NoLogsDelivered,
    GatewayThrottling,
    NoConsumerGatewayThrottling,
    ConfigNotGenerated,
    /// The self-monitor could not be sampled
    Unknown,
}

impl FlowHealth {
    pub fn reason(&self) -> &'static str {
        match self {
            FlowHealth::Healthy => REASON_SELF_MON_FLOW_HEALTHY,
            FlowHealth::AllDataDropped => REASON_SELF_MON_ALL_DATA_DROPPED,
            FlowHealth::SomeDataDropped => REASON_SELF_MON_SOME_DATA_DROPPED,
            FlowHealth::BufferFillingUp => REASON_SELF_MON_BUFFER_FILLING_UP,
            FlowHealth::NoLogsDelivered => REASON_SELF_MON_NO_LOGS_DELIVERED,
            FlowHealth::GatewayThrottling => REASON_SELF_MON_GATEWAY_THROTTLING,
            FlowHealth::NoConsumerGatewayThrottling => {
                REASON_SELF_MON_NO_CONSUMER_GATEWAY_THROTTLING
            }
            FlowHealth::ConfigNotGenerated => REASON_SELF_MON_CONFIG_NOT_GENERATED,
            FlowHealth::Unknown => REASON_SELF_MON_PROBING_FAILED,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            FlowHealth::Healthy => CONDITION_STATUS_TRUE,
            FlowHealth::Unknown => CONDITION_STATUS_UNKNOWN,
            _ => CONDITION_STATUS_FALSE,
        }
    }
}

/// Which kind of workload exports a pipeline's data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowSource {
    Collector,
    FluentBit,
}

/// One sample of the exposition
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

fn parse_labels(raw: &str) -> Option<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    let mut chars = raw.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return Some(labels);
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            name.push(c);
            chars.next();
        }
        if chars.next() != Some('=') || chars.next() != Some('"') {
            return None;
        }

        let mut value = String::new();
        loop {
            match chars.next()? {
                '\\' => match chars.next()? {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                '"' => break,
                c => value.push(c),
            }
        }
        labels.insert(name.trim().to_string(), value);
    }
}

fn parse_line(line: &str) -> Option<Sample> {
    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            (
                &line[..open],
                parse_labels(&line[open + 1..close])?,
                &line[close + 1..],
            )
        }
        None => {
            let split = line.find(char::is_whitespace)?;
            (&line[..split], BTreeMap::new(), &line[split..])
        }
    };
    let value = rest.split_whitespace().next()?.parse::<f64>().ok()?;
    Some(Sample {
        name: name.trim().to_string(),
        labels,
        value,
    })
}

/// Parse the Prometheus text exposition format, skipping malformed lines
pub fn parse_exposition(text: &str) -> Vec<Sample> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let sample = parse_line(line);
            if sample.is_none() {
                debug!("Skipping unparsable exposition line: {}", line);
            }
            sample
        })
        .collect()
}

/// Samples taken from the self-monitor at one point in time
#[derive(Clone, Debug, Default)]
pub struct FlowSnapshot {
    samples: Vec<Sample>,
}

impl FlowSnapshot {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Sum of a series, optionally restricted to one pipeline
    fn sum(&self, name: &str, pipeline: Option<&str>) -> f64 {
        self.samples
            .iter()
            .filter(|s| s.name == name)
            .filter(|s| match pipeline {
                Some(p) => s.labels.get(PIPELINE_LABEL).map(String::as_str) == Some(p),
                None => true,
            })
            .map(|s| s.value)
            .filter(|v| v.is_finite())
            .sum()
    }

    fn max(&self, name: &str, pipeline: &str) -> f64 {
        self.samples
            .iter()
            .filter(|s| s.name == name)
            .filter(|s| s.labels.get(PIPELINE_LABEL).map(String::as_str) == Some(pipeline))
            .map(|s| s.value)
            .filter(|v| v.is_finite())
            .fold(0.0, f64::max)
    }

    /// Classify the flow of one pipeline; first matching rule wins
    pub fn classify(&self, signal: Signal, pipeline: &str) -> FlowHealth {
        let data_type = signal.data_type();
        let rate = |counter: &str| format!("otelcol_{counter}_{data_type}:rate5m");

        let sent = self.sum(&rate("exporter_sent"), Some(pipeline));
        let failed = self.sum(&rate("exporter_send_failed"), Some(pipeline))
            + self.sum(&rate("exporter_enqueue_failed"), Some(pipeline));
        let queue = self.max("otelcol_exporter_queue_utilization", pipeline);
        let refused = self.sum(&rate("receiver_refused"), None);

        if sent == 0.0 && failed > 0.0 {
            FlowHealth::AllDataDropped
        } else if sent > 0.0 && failed > 0.0 {
            FlowHealth::SomeDataDropped
        } else if queue > BUFFER_FILLING_UP_RATIO {
            FlowHealth::BufferFillingUp
        } else if refused > 0.0 && sent == 0.0 {
            FlowHealth::NoConsumerGatewayThrottling
        } else if refused > 0.0 {
            FlowHealth::GatewayThrottling
        } else {
            FlowHealth::Healthy
        }
    }
}

impl FlowSnapshot {
    /// Classify the flow of a pipeline served by the Fluent Bit agent
    pub fn classify_fluent_bit(&self, pipeline: &str) -> FlowHealth {
        let p = Some(pipeline);
        let delivered = self.sum("fluentbit_output_proc_records_total:rate5m", p);
        let dropped = self.sum("fluentbit_output_dropped_records_total:rate5m", p)
            + self.sum("fluentbit_output_retries_failed_total:rate5m", p);
        let read = self.sum("fluentbit_input_records_total:rate5m", p);
        let buffer = self.max("telemetry_fsbuffer_usage_bytes", pipeline);
        let buffer_full = buffer > FLUENT_BIT_BUFFER_FULL_BYTES;

        if delivered == 0.0 && (dropped > 0.0 || buffer_full) {
            FlowHealth::AllDataDropped
        } else if dropped > 0.0 || buffer_full {
            FlowHealth::SomeDataDropped
        } else if read > 0.0 && delivered == 0.0 {
            FlowHealth::NoLogsDelivered
        } else if buffer > FLUENT_BIT_BUFFER_IN_USE_BYTES {
            FlowHealth::BufferFillingUp
        } else {
            FlowHealth::Healthy
        }
    }
}

/// Flow verdict for a pipeline given an optional snapshot
pub fn flow_health(
    snapshot: Option<&FlowSnapshot>,
    signal: Signal,
    source: FlowSource,
    pipeline: &str,
    config_generated: bool,
) -> FlowHealth {
    if !config_generated {
        return FlowHealth::ConfigNotGenerated;
    }
    match (snapshot, source) {
        (Some(snapshot), FlowSource::Collector) => snapshot.classify(signal, pipeline),
        (Some(snapshot), FlowSource::FluentBit) => snapshot.classify_fluent_bit(pipeline),
        (None, _) => FlowHealth::Unknown,
    }
}

/// HTTP client for the self-monitor metrics endpoint
#[derive(Clone)]
pub struct SelfMonitorClient {
    http: reqwest::Client,
    url: String,
}

impl SelfMonitorClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and parse the current exposition
    pub async fn sample(&self) -> Result<FlowSnapshot> {
        let response = self.http.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(Error::ConfigError(format!(
                "self-monitor at {} answered with {}",
                self.url,
                response.status()
            )));
        }
        let body = response.text().await?;
        Ok(FlowSnapshot::new(parse_exposition(&body)))
    }

    /// Like [`Self::sample`], but an unreachable monitor yields `None`
    pub async fn try_sample(&self) -> Option<FlowSnapshot> {
        match self.sample().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Self-monitor probing failed: {}", e);
                None
            }
        }
    }
}
