//! Operator overrides
//!
//! An optional ConfigMap in the operator namespace can pause the
//! reconciliation of a signal or change the collectors' log level.
//! It is read at the start of every reconcile.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;
use serde::Deserialize;
use tracing::warn;

use crate::crd::Signal;
use crate::error::Result;

pub const DEFAULT_OVERRIDE_CONFIG_MAP: &str = "telemetry-override-config";
pub const OVERRIDE_CONFIG_KEY: &str = "override-config";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overrides {
    #[serde(default)]
    pub global: GlobalOverrides,

    #[serde(default)]
    pub logging: SignalOverrides,

    #[serde(default)]
    pub metrics: SignalOverrides,

    #[serde(default)]
    pub tracing: SignalOverrides,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalOverrides {
    #[serde(default)]
    pub log_level: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalOverrides {
    #[serde(default)]
    pub paused: bool,
}

impl Overrides {
    pub fn parse(document: &str) -> Result<Self> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(document)?)
    }

    pub fn is_paused(&self, signal: Signal) -> bool {
        match signal {
            Signal::Logs => self.logging.paused,
            Signal::Metrics => self.metrics.paused,
            Signal::Traces => self.tracing.paused,
        }
    }

    /// Log level for the collectors' own logs
    pub fn collector_log_level(&self) -> &str {
        match self.global.log_level.to_lowercase().as_str() {
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" => "error",
            _ => "info",
        }
    }
}

/// Read the overrides ConfigMap; a missing or malformed document means
/// no overrides.
pub async fn load_overrides(client: &Client, namespace: &str, name: &str) -> Result<Overrides> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let Some(config_map) = api.get_opt(name).await? else {
        return Ok(Overrides::default());
    };
    let document = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(OVERRIDE_CONFIG_KEY))
        .cloned()
        .unwrap_or_default();

    match Overrides::parse(&document) {
        Ok(overrides) => Ok(overrides),
        Err(e) => {
            warn!("Ignoring malformed overrides in {}/{}: {}", namespace, name, e);
            Ok(Overrides::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let overrides = Overrides::parse(
            r#"
global:
  logLevel: DEBUG
tracing:
  paused: true
"#,
        )
        .unwrap();

        assert!(overrides.is_paused(Signal::Traces));
        assert!(!overrides.is_paused(Signal::Logs));
        assert_eq!(overrides.collector_log_level(), "debug");
    }

    #[test]
    fn test_empty_document_means_defaults() {
        let overrides = Overrides::parse("").unwrap();
        assert_eq!(overrides, Overrides::default());
        assert_eq!(overrides.collector_log_level(), "info");
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        assert!(Overrides::parse("tracing: [").is_err());
    }
}
