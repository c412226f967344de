//! Pipeline validation and the reconcilable subset
//!
//! Each pipeline gets one verdict. Checks run in a fixed order so the
//! reported reason is stable: structure first, then TLS structure,
//! then Secret references with TLS content errors taking precedence
//! over missing Secrets. The pipeline limit is applied last, across all
//! pipelines of the signal.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use reqwest::Url;
use tracing::debug;

use super::conditions::{
    REASON_ENDPOINT_INVALID, REASON_MAX_PIPELINES_EXCEEDED, REASON_REFERENCED_SECRET_MISSING,
    REASON_TLS_CERTIFICATE_EXPIRED, REASON_TLS_CERTIFICATE_INVALID,
    REASON_TLS_CONFIGURATION_INVALID, REASON_TLS_PRIVATE_KEY_INVALID, REASON_VALIDATION_FAILED,
};
use super::secrets::{ResolvedValues, SecretResolution, SecretResolver, SecretStore};
use super::tls::{self, TlsBundle, TlsError, TlsReport};
use crate::crd::{
    creation_order_key, OtlpOutput, OtlpProtocol, SecretKeyRef, TelemetryPipeline, TlsMaterial,
};
use crate::error::Result;

/// Why a pipeline is left out of the generated configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    ValidationFailed(String),
    EndpointInvalid(String),
    ReferencedSecretMissing(SecretKeyRef),
    Tls(TlsError),
    MaxPipelinesExceeded,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::ValidationFailed(_) => REASON_VALIDATION_FAILED,
            Rejection::EndpointInvalid(_) => REASON_ENDPOINT_INVALID,
            Rejection::ReferencedSecretMissing(_) => REASON_REFERENCED_SECRET_MISSING,
            Rejection::Tls(TlsError::ConfigurationInvalid(_)) => REASON_TLS_CONFIGURATION_INVALID,
            Rejection::Tls(TlsError::CertificateInvalid(_)) => REASON_TLS_CERTIFICATE_INVALID,
            Rejection::Tls(TlsError::PrivateKeyInvalid(_)) => REASON_TLS_PRIVATE_KEY_INVALID,
            Rejection::Tls(TlsError::CertificateExpired(_) | TlsError::CaCertificateExpired(_)) => {
                REASON_TLS_CERTIFICATE_EXPIRED
            }
            Rejection::MaxPipelinesExceeded => REASON_MAX_PIPELINES_EXCEEDED,
        }
    }
}

/// Verdict for one pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Reconcilable { values: ResolvedValues, tls: TlsReport },
    Rejected(Rejection),
}

impl Outcome {
    pub fn is_reconcilable(&self) -> bool {
        matches!(self, Outcome::Reconcilable { .. })
    }
}

/// A pipeline paired with its verdict
#[derive(Clone, Debug)]
pub struct Validated<'a, P> {
    pub pipeline: &'a P,
    pub outcome: Outcome,
}

/// Pipelines that made it into the configuration, with their values
pub fn reconcilable<'a, 'b, P>(
    validated: &'b [Validated<'a, P>],
) -> Vec<(&'a P, &'b ResolvedValues)> {
    validated
        .iter()
        .filter_map(|v| match &v.outcome {
            Outcome::Reconcilable { values, .. } => Some((v.pipeline, values)),
            Outcome::Rejected(_) => None,
        })
        .collect()
}

/// Validate an endpoint string for the given protocol
///
/// gRPC endpoints may omit the scheme but must carry a port; HTTP
/// endpoints need an http(s) scheme.
pub fn validate_endpoint(endpoint: &str, protocol: OtlpProtocol) -> Result<(), String> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err("endpoint is empty".to_string());
    }

    match protocol {
        OtlpProtocol::Grpc => {
            let with_scheme = if endpoint.contains("://") {
                endpoint.to_string()
            } else {
                format!("http://{endpoint}")
            };
            let url = Url::parse(&with_scheme).map_err(|e| format!("parse {endpoint:?}: {e}"))?;
            if url.host_str().map(str::is_empty).unwrap_or(true) {
                return Err(format!("endpoint {endpoint:?} has no host"));
            }
            if url.port().is_none() && !endpoint.contains("://") {
                return Err("missing port".to_string());
            }
            Ok(())
        }
        OtlpProtocol::Http => {
            let url = Url::parse(endpoint).map_err(|e| format!("parse {endpoint:?}: {e}"))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err("missing or unsupported protocol scheme".to_string());
            }
            if url.host_str().map(str::is_empty).unwrap_or(true) {
                return Err(format!("endpoint {endpoint:?} has no host"));
            }
            Ok(())
        }
    }
}

fn check_otlp_structure(output: &OtlpOutput) -> Option<Rejection> {
    if !output.endpoint.is_defined() {
        return Some(Rejection::EndpointInvalid("endpoint is not defined".to_string()));
    }
    if !output.endpoint.value.is_empty() {
        if let Err(e) = validate_endpoint(&output.endpoint.value, output.protocol) {
            return Some(Rejection::EndpointInvalid(e));
        }
    }

    if let Some(basic) = output.basic_auth() {
        if !basic.user.is_defined() || !basic.password.is_defined() {
            return Some(Rejection::ValidationFailed(
                "basic authentication requires both user and password".to_string(),
            ));
        }
    }

    let mut seen = HashSet::new();
    for header in &output.headers {
        if header.name.trim().is_empty() {
            return Some(Rejection::ValidationFailed(
                "header name must not be empty".to_string(),
            ));
        }
        if !seen.insert(header.name.to_lowercase()) {
            return Some(Rejection::ValidationFailed(format!(
                "header {} is defined more than once",
                header.name
            )));
        }
        if !header.value.is_defined() {
            return Some(Rejection::ValidationFailed(format!(
                "header {} has no value",
                header.name
            )));
        }
    }
    None
}

fn check_structure<P: TelemetryPipeline>(pipeline: &P) -> Option<Rejection> {
    if pipeline.output_count() != 1 {
        return Some(Rejection::ValidationFailed(
            "exactly one output must be defined".to_string(),
        ));
    }
    if let Some(output) = pipeline.otlp_output() {
        if let Some(rejection) = check_otlp_structure(output) {
            return Some(rejection);
        }
    }

    let material = pipeline.tls_material();
    let cert = material.cert.map(|v| v.is_defined()).unwrap_or(false);
    let key = material.key.map(|v| v.is_defined()).unwrap_or(false);
    if cert != key {
        return Some(Rejection::Tls(TlsError::ConfigurationInvalid(
            "certificate and private key must be set together".to_string(),
        )));
    }
    None
}

fn tls_refs<'a>(material: &TlsMaterial<'a>) -> Vec<&'a SecretKeyRef> {
    let mut refs: Vec<&SecretKeyRef> = [material.ca, material.cert, material.key]
        .into_iter()
        .flatten()
        .filter_map(|v| v.secret_ref())
        .collect();
    refs.sort();
    refs.dedup();
    refs
}

fn check_tls(
    material: &TlsMaterial<'_>,
    values: &ResolvedValues,
    now: DateTime<Utc>,
) -> Result<TlsReport, TlsError> {
    let bundle = TlsBundle {
        ca: values.get_opt(material.ca),
        cert: values.get_opt(material.cert),
        key: values.get_opt(material.key),
    };
    tls::validate(&bundle, now)
}

/// Validate one pipeline, ignoring the pipeline limit
pub async fn validate_pipeline<P, S>(
    pipeline: &P,
    resolver: &mut SecretResolver<S>,
    now: DateTime<Utc>,
) -> Result<Outcome>
where
    P: TelemetryPipeline,
    S: SecretStore,
{
    if let Some(rejection) = check_structure(pipeline) {
        return Ok(Outcome::Rejected(rejection));
    }

    let material = pipeline.tls_material();
    let values = match resolver.resolve(&pipeline.secret_refs()).await? {
        SecretResolution::Resolved(values) => values,
        SecretResolution::Missing(missing) => {
            // TLS problems win over missing Secrets once the TLS values resolve
            let tls_resolution = resolver.resolve(&tls_refs(&material)).await?;
            if let SecretResolution::Resolved(tls_values) = tls_resolution {
                if let Err(e) = check_tls(&material, &tls_values, now) {
                    return Ok(Outcome::Rejected(Rejection::Tls(e)));
                }
            }
            return Ok(Outcome::Rejected(Rejection::ReferencedSecretMissing(missing)));
        }
        SecretResolution::NotUtf8(reference) => {
            return Ok(Outcome::Rejected(Rejection::ValidationFailed(format!(
                "value of key '{}' in Secret '{}' of Namespace '{}' is not valid UTF-8",
                reference.key, reference.name, reference.namespace
            ))));
        }
    };

    let tls = match check_tls(&material, &values, now) {
        Ok(report) => report,
        Err(e) => return Ok(Outcome::Rejected(Rejection::Tls(e))),
    };

    if let Some(output) = pipeline.otlp_output() {
        if output.endpoint.value.is_empty() {
            let endpoint = values.get(&output.endpoint).unwrap_or_default();
            if let Err(e) = validate_endpoint(endpoint, output.protocol) {
                return Ok(Outcome::Rejected(Rejection::EndpointInvalid(e)));
            }
        }
    }

    Ok(Outcome::Reconcilable { values, tls })
}

/// Validate every live pipeline of a signal and apply the pipeline limit
///
/// Pipelines are processed oldest first (ties broken by name); valid
/// pipelines beyond `max_pipelines` are rejected. Pipelines being
/// deleted are left out entirely.
pub async fn validate_all<'a, P, S>(
    pipelines: &'a [P],
    resolver: &mut SecretResolver<S>,
    max_pipelines: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Validated<'a, P>>>
where
    P: TelemetryPipeline,
    S: SecretStore,
{
    let mut live: Vec<&P> = pipelines.iter().filter(|p| !p.is_being_deleted()).collect();
    live.sort_by_key(|p| creation_order_key(*p));

    let mut admitted = 0usize;
    let mut validated = Vec::with_capacity(live.len());
    for pipeline in live {
        let mut outcome = validate_pipeline(pipeline, resolver, now).await?;
        if outcome.is_reconcilable() {
            if admitted >= max_pipelines {
                outcome = Outcome::Rejected(Rejection::MaxPipelinesExceeded);
            } else {
                admitted += 1;
            }
        }
        if let Outcome::Rejected(rejection) = &outcome {
            debug!(
                "{} {} is not reconcilable: {}",
                P::SIGNAL.pipeline_kind(),
                kube::ResourceExt::name_any(pipeline),
                rejection.reason()
            );
        }
        validated.push(Validated { pipeline, outcome });
    }
    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::secrets::StaticSecretStore;
    use crate::crd::{
        AuthenticationOptions, BasicAuthOptions, Header, OtlpTls, TracePipeline, TracePipelineSpec,
        TraceOutput, ValueType,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn trace_pipeline(name: &str, created_minutes_ago: i64, otlp: OtlpOutput) -> TracePipeline {
        let mut p = TracePipeline::new(
            name,
            TracePipelineSpec {
                output: TraceOutput { otlp },
            },
        );
        p.metadata.creation_timestamp =
            Some(Time(Utc::now() - chrono::Duration::minutes(created_minutes_ago)));
        p
    }

    fn endpoint(url: &str) -> OtlpOutput {
        OtlpOutput {
            endpoint: ValueType::inline(url),
            ..Default::default()
        }
    }

    #[test]
    fn test_grpc_endpoint_rules() {
        assert!(validate_endpoint("http://collector.example:4317", OtlpProtocol::Grpc).is_ok());
        assert!(validate_endpoint("collector.example:4317", OtlpProtocol::Grpc).is_ok());
        assert_eq!(
            validate_endpoint("collector.example", OtlpProtocol::Grpc),
            Err("missing port".to_string())
        );
        assert!(validate_endpoint("", OtlpProtocol::Grpc).is_err());
    }

    #[test]
    fn test_http_endpoint_rules() {
        assert!(validate_endpoint("https://collector.example", OtlpProtocol::Http).is_ok());
        assert_eq!(
            validate_endpoint("ftp://collector.example", OtlpProtocol::Http),
            Err("missing or unsupported protocol scheme".to_string())
        );
        assert!(validate_endpoint("collector.example", OtlpProtocol::Http).is_err());
    }

    #[tokio::test]
    async fn test_inline_pipeline_is_reconcilable() {
        let mut resolver = SecretResolver::new(StaticSecretStore::default());
        let p = trace_pipeline("a", 1, endpoint("http://collector.example:4317"));
        let outcome = validate_pipeline(&p, &mut resolver, Utc::now()).await.unwrap();
        assert!(outcome.is_reconcilable());
    }

    #[tokio::test]
    async fn test_missing_secret_is_reported() {
        let mut resolver = SecretResolver::new(StaticSecretStore::default());
        let p = trace_pipeline(
            "a",
            1,
            OtlpOutput {
                endpoint: ValueType::from_secret("backend", "default", "endpoint"),
                ..Default::default()
            },
        );
        let outcome = validate_pipeline(&p, &mut resolver, Utc::now()).await.unwrap();
        match outcome {
            Outcome::Rejected(r) => assert_eq!(r.reason(), REASON_REFERENCED_SECRET_MISSING),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_secret_endpoint_is_validated_after_resolution() {
        let store =
            StaticSecretStore::default().with("backend", "default", &[("endpoint", "not a url")]);
        let mut resolver = SecretResolver::new(store);
        let p = trace_pipeline(
            "a",
            1,
            OtlpOutput {
                protocol: OtlpProtocol::Http,
                endpoint: ValueType::from_secret("backend", "default", "endpoint"),
                ..Default::default()
            },
        );
        let outcome = validate_pipeline(&p, &mut resolver, Utc::now()).await.unwrap();
        assert!(matches!(outcome, Outcome::Rejected(Rejection::EndpointInvalid(_))));
    }

    #[tokio::test]
    async fn test_secret_value_that_is_not_utf8_fails_validation() {
        let store = StaticSecretStore::default().with_bytes(
            "backend",
            "default",
            "endpoint",
            &[0x68, 0x74, 0xc3, 0x28],
        );
        let mut resolver = SecretResolver::new(store);
        let p = trace_pipeline(
            "a",
            1,
            OtlpOutput {
                endpoint: ValueType::from_secret("backend", "default", "endpoint"),
                ..Default::default()
            },
        );
        let outcome = validate_pipeline(&p, &mut resolver, Utc::now()).await.unwrap();
        let Outcome::Rejected(Rejection::ValidationFailed(detail)) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(detail.contains("not valid UTF-8"));
    }

    #[tokio::test]
    async fn test_half_basic_auth_fails_validation() {
        let mut resolver = SecretResolver::new(StaticSecretStore::default());
        let mut output = endpoint("http://collector.example:4317");
        output.authentication = Some(AuthenticationOptions {
            basic: Some(BasicAuthOptions {
                user: ValueType::inline("user"),
                password: ValueType::default(),
            }),
        });
        let outcome = validate_pipeline(&trace_pipeline("a", 1, output), &mut resolver, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Rejected(Rejection::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_duplicate_headers_fail_validation() {
        let mut resolver = SecretResolver::new(StaticSecretStore::default());
        let mut output = endpoint("http://collector.example:4317");
        let header = Header {
            name: "X-Tenant".to_string(),
            prefix: String::new(),
            value: ValueType::inline("a"),
        };
        output.headers = vec![header.clone(), header];
        let outcome = validate_pipeline(&trace_pipeline("a", 1, output), &mut resolver, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Rejected(Rejection::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_cert_without_key_is_tls_configuration_invalid() {
        let mut resolver = SecretResolver::new(StaticSecretStore::default());
        let mut output = endpoint("http://collector.example:4317");
        output.tls = Some(OtlpTls {
            cert: Some(ValueType::inline("cert")),
            ..Default::default()
        });
        let outcome = validate_pipeline(&trace_pipeline("a", 1, output), &mut resolver, Utc::now())
            .await
            .unwrap();
        match outcome {
            Outcome::Rejected(r) => assert_eq!(r.reason(), REASON_TLS_CONFIGURATION_INVALID),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tls_error_dominates_missing_secret() {
        let store = StaticSecretStore::default().with(
            "tls",
            "default",
            &[("cert", "garbage"), ("key", "garbage")],
        );
        let mut resolver = SecretResolver::new(store);
        let output = OtlpOutput {
            endpoint: ValueType::from_secret("backend", "default", "endpoint"),
            tls: Some(OtlpTls {
                cert: Some(ValueType::from_secret("tls", "default", "cert")),
                key: Some(ValueType::from_secret("tls", "default", "key")),
                ..Default::default()
            }),
            ..Default::default()
        };
        let outcome = validate_pipeline(&trace_pipeline("a", 1, output), &mut resolver, Utc::now())
            .await
            .unwrap();
        match outcome {
            Outcome::Rejected(r) => assert_eq!(r.reason(), REASON_TLS_CERTIFICATE_INVALID),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unresolved_tls_key_is_secret_missing() {
        let store = StaticSecretStore::default().with("tls", "default", &[("cert", "garbage")]);
        let mut resolver = SecretResolver::new(store);
        let mut output = endpoint("http://collector.example:4317");
        output.tls = Some(OtlpTls {
            cert: Some(ValueType::from_secret("tls", "default", "cert")),
            key: Some(ValueType::from_secret("tls", "default", "key")),
            ..Default::default()
        });
        let outcome = validate_pipeline(&trace_pipeline("a", 1, output), &mut resolver, Utc::now())
            .await
            .unwrap();
        match outcome {
            Outcome::Rejected(r) => assert_eq!(r.reason(), REASON_REFERENCED_SECRET_MISSING),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pipeline_limit_rejects_newest() {
        let mut resolver = SecretResolver::new(StaticSecretStore::default());
        let pipelines: Vec<TracePipeline> = (0..6)
            .map(|i| {
                trace_pipeline(
                    &format!("p{i}"),
                    60 - i,
                    endpoint("http://collector.example:4317"),
                )
            })
            .collect();

        let validated = validate_all(&pipelines, &mut resolver, 5, Utc::now()).await.unwrap();

        assert_eq!(validated.len(), 6);
        assert_eq!(reconcilable(&validated).len(), 5);
        let last = validated.last().unwrap();
        assert_eq!(kube::ResourceExt::name_any(last.pipeline), "p5");
        assert_eq!(last.outcome, Outcome::Rejected(Rejection::MaxPipelinesExceeded));
    }

    #[tokio::test]
    async fn test_invalid_pipelines_do_not_take_slots() {
        let mut resolver = SecretResolver::new(StaticSecretStore::default());
        let mut pipelines = vec![trace_pipeline("broken", 100, endpoint("ftp://nope"))];
        pipelines[0].spec.output.otlp.protocol = OtlpProtocol::Http;
        pipelines.push(trace_pipeline("ok", 1, endpoint("http://collector.example:4317")));

        let validated = validate_all(&pipelines, &mut resolver, 1, Utc::now()).await.unwrap();
        let ok = reconcilable(&validated);
        assert_eq!(ok.len(), 1);
        assert_eq!(kube::ResourceExt::name_any(ok[0].0), "ok");
    }

    #[tokio::test]
    async fn test_ties_broken_by_name() {
        let mut resolver = SecretResolver::new(StaticSecretStore::default());
        let created = Time(Utc::now());
        let mut pipelines: Vec<TracePipeline> = ["b", "a"]
            .iter()
            .map(|n| trace_pipeline(n, 0, endpoint("http://collector.example:4317")))
            .collect();
        for p in &mut pipelines {
            p.metadata.creation_timestamp = Some(created.clone());
        }

        let validated = validate_all(&pipelines, &mut resolver, 1, Utc::now()).await.unwrap();
        assert_eq!(kube::ResourceExt::name_any(reconcilable(&validated)[0].0), "a");
    }
}
