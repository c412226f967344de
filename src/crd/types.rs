//! Shared types for telemetry pipeline specifications
//!
//! These types are reused by the three pipeline kinds and by the
//! controller logic that validates and renders them.
//!
//! # Type Hierarchy
//!
//! - [`Signal`] - The telemetry signal a pipeline carries (logs, metrics, traces)
//! - [`ValueType`] - A value given inline or as a reference to a Secret key
//! - [`OtlpOutput`] - OTLP exporter target with optional auth, headers and TLS
//! - [`OtlpTls`] - TLS triple (CA, client certificate, client key)
//! - [`NamespaceSelector`] - Include/exclude namespace lists used by inputs
//! - [`Condition`] - Status condition written by the operator

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Telemetry signal handled by a pipeline kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Signal {
    Logs,
    Metrics,
    Traces,
}

impl Signal {
    /// All signals, in the order the Telemetry resource reports them
    pub const ALL: [Signal; 3] = [Signal::Logs, Signal::Metrics, Signal::Traces];

    /// Lowercase plural name used in collector pipeline ids
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Logs => "logs",
            Signal::Metrics => "metrics",
            Signal::Traces => "traces",
        }
    }

    /// Short singular name used in resource names ("log", "metric", "trace")
    pub fn short_name(&self) -> &'static str {
        match self {
            Signal::Logs => "log",
            Signal::Metrics => "metric",
            Signal::Traces => "trace",
        }
    }

    /// Capitalised name used in condition types and messages
    pub fn title(&self) -> &'static str {
        match self {
            Signal::Logs => "Log",
            Signal::Metrics => "Metric",
            Signal::Traces => "Trace",
        }
    }

    /// Pipeline kind handling this signal
    pub fn pipeline_kind(&self) -> &'static str {
        match self {
            Signal::Logs => "LogPipeline",
            Signal::Metrics => "MetricPipeline",
            Signal::Traces => "TracePipeline",
        }
    }

    /// Name of the data unit in collector self-metrics
    pub fn data_type(&self) -> &'static str {
        match self {
            Signal::Logs => "log_records",
            Signal::Metrics => "metric_points",
            Signal::Traces => "spans",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A value given inline or sourced from a Secret key
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueType {
    /// Inline value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    /// Reference to a key in a Secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFromSource>,
}

impl ValueType {
    pub fn inline(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            value_from: None,
        }
    }

    pub fn from_secret(
        name: impl Into<String>,
        namespace: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            value: String::new(),
            value_from: Some(ValueFromSource {
                secret_key_ref: Some(SecretKeyRef {
                    name: name.into(),
                    namespace: namespace.into(),
                    key: key.into(),
                }),
            }),
        }
    }

    /// Secret reference, if the value is not inline
    pub fn secret_ref(&self) -> Option<&SecretKeyRef> {
        self.value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
    }

    /// True when either an inline value or a complete secret reference is set
    pub fn is_defined(&self) -> bool {
        if !self.value.is_empty() {
            return true;
        }
        self.secret_ref().map(|r| r.is_complete()).unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueFromSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyRef>,
}

/// Points at one key of one Secret
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub namespace: String,
    pub key: String,
}

impl SecretKeyRef {
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.namespace.is_empty() && !self.key.is_empty()
    }
}

impl fmt::Display for SecretKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.key)
    }
}

/// Wire protocol for an OTLP output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

impl fmt::Display for OtlpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtlpProtocol::Grpc => write!(f, "grpc"),
            OtlpProtocol::Http => write!(f, "http"),
        }
    }
}

/// OTLP exporter target
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtlpOutput {
    #[serde(default)]
    pub protocol: OtlpProtocol,

    pub endpoint: ValueType,

    /// Path appended to the endpoint (HTTP protocol only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationOptions>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<OtlpTls>,
}

impl OtlpOutput {
    pub fn basic_auth(&self) -> Option<&BasicAuthOptions> {
        self.authentication.as_ref().and_then(|a| a.basic.as_ref())
    }

    /// All values of this output that may reference a Secret
    pub fn values(&self) -> Vec<&ValueType> {
        let mut values = vec![&self.endpoint];
        if let Some(basic) = self.basic_auth() {
            values.push(&basic.user);
            values.push(&basic.password);
        }
        for header in &self.headers {
            values.push(&header.value);
        }
        if let Some(tls) = &self.tls {
            values.extend([&tls.ca, &tls.cert, &tls.key].into_iter().flatten());
        }
        values
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthOptions>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthOptions {
    pub user: ValueType,
    pub password: ValueType,
}

/// Extra header sent with every export request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub name: String,

    /// Prefix prepended to the value, e.g. "Bearer"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,

    #[serde(flatten)]
    pub value: ValueType,
}

/// TLS settings for an OTLP output
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtlpTls {
    #[serde(default)]
    pub insecure: bool,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<ValueType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<ValueType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ValueType>,
}

/// Borrowed view of a TLS triple, independent of the output flavour
#[derive(Clone, Copy, Debug, Default)]
pub struct TlsMaterial<'a> {
    pub ca: Option<&'a ValueType>,
    pub cert: Option<&'a ValueType>,
    pub key: Option<&'a ValueType>,
}

impl<'a> TlsMaterial<'a> {
    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.cert.is_none() && self.key.is_none()
    }
}

impl OtlpTls {
    pub fn material(&self) -> TlsMaterial<'_> {
        TlsMaterial {
            ca: self.ca.as_ref(),
            cert: self.cert.as_ref(),
            key: self.key.as_ref(),
        }
    }
}

/// Include/exclude namespace lists
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl NamespaceSelector {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

/// OTLP push input
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtlpInput {
    #[serde(default)]
    pub disabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceSelector>,
}

/// Kubernetes-style status condition
///
/// Condition lists written by the operator keep a fixed type order; see
/// `controller::status`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "ConfigurationGenerated", "GatewayHealthy")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned (RFC 3339)
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// The .metadata.generation that the condition was set based upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
