//! LogPipeline Custom Resource Definition
//!
//! A LogPipeline collects container logs from the nodes (application
//! input) or accepts OTLP pushes, and ships them to exactly one output:
//! an HTTP endpoint, an OTLP endpoint, or a custom output fragment.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, NamespaceSelector, OtlpInput, OtlpOutput, TlsMaterial, ValueType};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "telemetry.kube-ops.io",
    version = "v1alpha1",
    kind = "LogPipeline",
    status = "LogPipelineStatus",
    shortname = "lp",
    printcolumn = r#"{"name":"Configuration Generated","type":"string","jsonPath":".status.conditions[?(@.type=='ConfigurationGenerated')].status"}"#,
    printcolumn = r#"{"name":"Agent Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='AgentHealthy')].status"}"#,
    printcolumn = r#"{"name":"Flow Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='TelemetryFlowHealthy')].status"}"#,
    printcolumn = r#"{"name":"Unsupported Mode","type":"boolean","jsonPath":".status.unsupportedMode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LogPipelineSpec {
    #[serde(default)]
    pub input: LogInput,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<LogFilter>,

    #[serde(default)]
    pub output: LogOutput,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationInput>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpInput>,
}

/// Tails container log files on every node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInput {
    /// Defaults to true when the block is present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub namespaces: InputNamespaces,

    #[serde(default)]
    pub containers: InputContainers,

    #[serde(default)]
    pub keep_annotations: bool,

    #[serde(default)]
    pub drop_labels: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputNamespaces {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    /// Also collect from system namespaces
    #[serde(default)]
    pub system: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputContainers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// Raw filter fragment passed to the log agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogOutput {
    /// Raw output fragment passed to the log agent
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpOutput>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpOutput>,
}

impl LogOutput {
    pub fn is_custom_defined(&self) -> bool {
        !self.custom.trim().is_empty()
    }

    pub fn is_http_defined(&self) -> bool {
        self.http
            .as_ref()
            .map(|h| h.host.is_defined())
            .unwrap_or(false)
    }

    pub fn is_otlp_defined(&self) -> bool {
        self.otlp.is_some()
    }

    /// Number of output plugins configured; exactly one is valid
    pub fn defined_count(&self) -> usize {
        [
            self.is_custom_defined(),
            self.is_http_defined(),
            self.is_otlp_defined(),
        ]
        .iter()
        .filter(|d| **d)
        .count()
    }
}

/// HTTP output of the log agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpOutput {
    #[serde(default)]
    pub host: ValueType,

    #[serde(default)]
    pub user: ValueType,

    #[serde(default)]
    pub password: ValueType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compress: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,

    #[serde(default)]
    pub tls: HttpTls,

    #[serde(default)]
    pub dedot: bool,
}

impl HttpOutput {
    pub fn values(&self) -> Vec<&ValueType> {
        let mut values = vec![&self.host];
        if self.user.is_defined() {
            values.push(&self.user);
        }
        if self.password.is_defined() {
            values.push(&self.password);
        }
        values.extend(
            [&self.tls.ca, &self.tls.cert, &self.tls.key]
                .into_iter()
                .flatten(),
        );
        values
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpTls {
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub skip_certificate_validation: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<ValueType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<ValueType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ValueType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogPipelineStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Set when the pipeline uses custom filter or output fragments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsupported_mode: Option<bool>,
}

impl LogPipelineSpec {
    /// Whether the node-level application log input is active
    pub fn application_input_enabled(&self) -> bool {
        self.input
            .application
            .as_ref()
            .map(|a| a.enabled.unwrap_or(true))
            .unwrap_or(true)
    }

    /// Custom fragments bypass the schema-level output contract
    pub fn contains_custom_plugin(&self) -> bool {
        self.filters.iter().any(|f| !f.custom.trim().is_empty()) || self.output.is_custom_defined()
    }

    pub fn tls_material(&self) -> TlsMaterial<'_> {
        if let Some(otlp) = &self.output.otlp {
            return otlp.tls.as_ref().map(|t| t.material()).unwrap_or_default();
        }
        if let Some(http) = &self.output.http {
            if http.tls.disabled {
                return TlsMaterial::default();
            }
            return TlsMaterial {
                ca: http.tls.ca.as_ref(),
                cert: http.tls.cert.as_ref(),
                key: http.tls.key.as_ref(),
            };
        }
        TlsMaterial::default()
    }

    /// OTLP input namespace selector, if any
    pub fn otlp_namespaces(&self) -> Option<&NamespaceSelector> {
        self.input.otlp.as_ref().and_then(|o| o.namespaces.as_ref())
    }
}
