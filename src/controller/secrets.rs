//! Resolution of values that reference Secret keys
//!
//! A reconcile pass resolves the references of every pipeline of a
//! signal through one [`SecretResolver`], so each Secret is fetched at
//! most once per pass. Watching the Secrets is the controller's job
//! (see `run_pipeline_controller`).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use tracing::debug;

use crate::crd::{SecretKeyRef, ValueType};
use crate::error::{Error, Result};

pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Read access to Secrets
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Data of a Secret, `None` when it does not exist
    async fn secret_data(&self, name: &str, namespace: &str) -> Result<Option<SecretData>>;
}

/// Secrets read straight from the API server
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn secret_data(&self, name: &str, namespace: &str) -> Result<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| Error::SecretResolution {
                name: name.to_string(),
                namespace: namespace.to_string(),
                reason: e.to_string(),
            })?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }
}

/// Values resolved from Secrets, keyed by reference
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedValues {
    values: BTreeMap<SecretKeyRef, String>,
}

impl ResolvedValues {
    pub fn insert(&mut self, reference: SecretKeyRef, value: String) {
        self.values.insert(reference, value);
    }

    /// Inline value, or the resolved value of the referenced key
    pub fn get<'a>(&'a self, value: &'a ValueType) -> Option<&'a str> {
        if !value.value.is_empty() {
            return Some(value.value.as_str());
        }
        value
            .secret_ref()
            .and_then(|r| self.values.get(r))
            .map(String::as_str)
    }

    pub fn get_opt<'a>(&'a self, value: Option<&'a ValueType>) -> Option<&'a str> {
        value.and_then(|v| self.get(v))
    }

    /// All resolved secret values, for checksumming
    pub fn iter(&self) -> impl Iterator<Item = (&SecretKeyRef, &String)> {
        self.values.iter()
    }
}

/// Outcome of resolving a set of references
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretResolution {
    Resolved(ResolvedValues),
    /// First reference (in sorted order) that could not be resolved
    Missing(SecretKeyRef),
    /// Reference whose value is not valid UTF-8
    NotUtf8(SecretKeyRef),
}

/// Result of looking up a single key
enum Lookup {
    Found(String),
    Absent,
    NotUtf8,
}

/// Resolves references against a [`SecretStore`], memoizing fetched Secrets
pub struct SecretResolver<S> {
    store: S,
    cache: HashMap<(String, String), Option<SecretData>>,
}

impl<S: SecretStore> SecretResolver<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    async fn lookup(&mut self, reference: &SecretKeyRef) -> Result<Lookup> {
        let cache_key = (reference.namespace.clone(), reference.name.clone());
        if !self.cache.contains_key(&cache_key) {
            let data = self
                .store
                .secret_data(&reference.name, &reference.namespace)
                .await?;
            self.cache.insert(cache_key.clone(), data);
        }

        let bytes = self
            .cache
            .get(&cache_key)
            .and_then(|data| data.as_ref())
            .and_then(|data| data.get(&reference.key));
        Ok(match bytes {
            Some(bytes) => match String::from_utf8(bytes.clone()) {
                Ok(value) => Lookup::Found(value),
                Err(_) => Lookup::NotUtf8,
            },
            None => Lookup::Absent,
        })
    }

    /// Resolve every reference; the first missing or unreadable one
    /// short-circuits.
    pub async fn resolve(&mut self, references: &[&SecretKeyRef]) -> Result<SecretResolution> {
        let mut resolved = ResolvedValues::default();
        for reference in references {
            if !reference.is_complete() {
                return Ok(SecretResolution::Missing((*reference).clone()));
            }
            match self.lookup(reference).await? {
                Lookup::Found(value) => resolved.insert((*reference).clone(), value),
                Lookup::Absent => {
                    debug!("Referenced secret key {} is missing", reference);
                    return Ok(SecretResolution::Missing((*reference).clone()));
                }
                Lookup::NotUtf8 => {
                    debug!("Referenced secret key {} is not valid UTF-8", reference);
                    return Ok(SecretResolution::NotUtf8((*reference).clone()));
                }
            }
        }
        Ok(SecretResolution::Resolved(resolved))
    }
}

/// Secrets held in memory
#[cfg(test)]
#[derive(Clone, Default)]
pub struct StaticSecretStore {
    secrets: BTreeMap<(String, String), SecretData>,
}

#[cfg(test)]
impl StaticSecretStore {
    pub fn with(mut self, name: &str, namespace: &str, data: &[(&str, &str)]) -> Self {
        self.secrets.insert(
            (namespace.to_string(), name.to_string()),
            data.iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
        );
        self
    }

    pub fn with_bytes(mut self, name: &str, namespace: &str, key: &str, value: &[u8]) -> Self {
        self.secrets
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_vec());
        self
    }
}

#[cfg(test)]
#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn secret_data(&self, name: &str, namespace: &str) -> Result<Option<SecretData>> {
        Ok(self
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
