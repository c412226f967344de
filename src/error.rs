//! Error types for the telemetry operator
//!
//! A single error enum is shared by the controllers, the resource
//! builders and the HTTP surface. Controllers use [`Error::is_retriable`]
//! to pick a requeue delay.

use thiserror::Error;

/// Errors produced while reconciling telemetry resources
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Secret {namespace}/{name} could not be resolved: {reason}")]
    SecretResolution {
        name: String,
        namespace: String,
        reason: String,
    },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Reconciliation exceeded its time budget of {0}s")]
    Timeout(u64),
}

impl Error {
    /// Whether the failure is likely to clear up on its own.
    ///
    /// Conflicts, throttling and connection failures against the API
    /// server fall into this bucket, as do timeouts.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            Error::KubeError(_) => true,
            Error::HttpError(_) => true,
            Error::Timeout(_) => true,
            Error::SecretResolution { .. } => true,
            Error::FinalizerError(_) => true,
            _ => false,
        }
    }

    /// Short, stable label used for the error counter metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::FinalizerError(_) => "finalizer",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::HttpError(_) => "http",
            Error::ConfigError(_) => "config",
            Error::SecretResolution { .. } => "secret",
            Error::MissingField(_) => "missing_field",
            Error::Timeout(_) => "timeout",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
