//! Human-readable condition messages
//!
//! Condition messages show up in `kubectl describe` and dashboards, so
//! every reason maps to one fixed rendering. Unknown reasons render as
//! the empty string.

use chrono::{DateTime, Utc};

use super::conditions::*;
use super::prober::PodIssue;
use super::resources::Component;
use super::tls::{Expiring, TlsError};
use super::validation::Rejection;
use crate::crd::Signal;

fn date(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}

/// Message for a reason whose rendering needs no parameters
pub fn reason_message(reason: &str, signal: Signal) -> String {
    let unit = match signal {
        Signal::Logs => "logs",
        Signal::Metrics => "metrics",
        Signal::Traces => "spans",
    };
    match reason {
        REASON_MAX_PIPELINES_EXCEEDED => "Maximum pipeline count limit exceeded".to_string(),
        REASON_ROLLOUT_IN_PROGRESS => "Pods are being started/updated".to_string(),
        REASON_GATEWAY_NOT_REQUIRED | REASON_AGENT_NOT_REQUIRED => String::new(),
        REASON_NO_PIPELINE_DEPLOYED => "No pipelines have been deployed".to_string(),
        REASON_COMPONENTS_RUNNING => format!("All {} components are running", signal.short_name()),
        REASON_SELF_MON_FLOW_HEALTHY => "No problems detected in the telemetry flow".to_string(),
        REASON_SELF_MON_ALL_DATA_DROPPED => {
            format!("Backend is not reachable or rejecting {unit}. All {unit} are dropped")
        }
        REASON_SELF_MON_SOME_DATA_DROPPED => {
            format!("Backend is reachable, but rejecting {unit}. Some {unit} are dropped")
        }
        REASON_SELF_MON_BUFFER_FILLING_UP => format!(
            "Buffer nearing capacity. Incoming {} rate exceeds export rate",
            signal.short_name()
        ),
        REASON_SELF_MON_NO_LOGS_DELIVERED => {
            "Backend is not reachable or rejecting logs. Logs are buffered and not yet dropped"
                .to_string()
        }
        REASON_SELF_MON_GATEWAY_THROTTLING => format!(
            "{} gateway is unable to receive {unit} at current rate",
            signal.title()
        ),
        REASON_SELF_MON_NO_CONSUMER_GATEWAY_THROTTLING => format!(
            "{} gateway is refusing {unit} and none are exported",
            signal.title()
        ),
        REASON_SELF_MON_CONFIG_NOT_GENERATED => {
            "No telemetry flow because the pipeline configuration was not generated".to_string()
        }
        REASON_SELF_MON_PROBING_FAILED => {
            "Could not determine the health of the telemetry flow because the self monitor probing failed"
                .to_string()
        }
        _ => String::new(),
    }
}

/// "{Signal} gateway/agent successfully configured"
pub fn configured_message(signal: Signal, component: Component) -> String {
    format!("{} {} successfully configured", signal.title(), component.name())
}

/// "{Signal} gateway Deployment is ready"
pub fn ready_message(signal: Signal, component: Component) -> String {
    format!(
        "{} {} {} is ready",
        signal.title(),
        component.name(),
        component.workload()
    )
}

pub fn not_deployed_message(component: Component) -> String {
    format!("{} is not yet created", component.workload())
}

pub fn about_to_expire_message(expiring: Expiring, not_after: &DateTime<Utc>) -> String {
    match expiring {
        Expiring::Certificate => {
            format!("TLS certificate is about to expire on {}", date(not_after))
        }
        Expiring::Ca => format!("TLS CA certificate is about to expire on {}", date(not_after)),
    }
}

pub fn tls_message(error: &TlsError) -> String {
    match error {
        TlsError::ConfigurationInvalid(detail) => format!("TLS configuration invalid: {detail}"),
        TlsError::CertificateInvalid(detail) => format!("TLS certificate invalid: {detail}"),
        TlsError::PrivateKeyInvalid(detail) => format!("TLS private key invalid: {detail}"),
        TlsError::CertificateExpired(not_after) => {
            format!("TLS certificate expired on {}", date(not_after))
        }
        TlsError::CaCertificateExpired(not_after) => {
            format!("TLS CA certificate expired on {}", date(not_after))
        }
    }
}

/// Message for a pipeline excluded from the configuration
pub fn rejection_message(rejection: &Rejection, signal: Signal) -> String {
    match rejection {
        Rejection::ValidationFailed(detail) => format!("Pipeline validation failed: {detail}"),
        Rejection::EndpointInvalid(detail) => format!("OTLP output endpoint invalid: {detail}"),
        Rejection::ReferencedSecretMissing(reference) => {
            format!(
                "One or more referenced Secrets are missing: Secret '{}' of Namespace '{}' (key '{}')",
                reference.name, reference.namespace, reference.key
            )
        }
        Rejection::Tls(error) => tls_message(error),
        Rejection::MaxPipelinesExceeded => reason_message(REASON_MAX_PIPELINES_EXCEEDED, signal),
    }
}

/// Rendering of a persistent pod problem
pub fn pod_issue_message(issue: &PodIssue) -> String {
    match issue {
        PodIssue::NotScheduled { message } => format!("Pod not scheduled: {message}"),
        PodIssue::Pending {
            container,
            reason,
            message,
        } => {
            let cause = if message.is_empty() { reason } else { message };
            pending_message(container, cause)
        }
        PodIssue::ImagePullBackOff { container, message } => {
            let cause = if message.is_empty() {
                "ImagePullBackOff"
            } else {
                message.as_str()
            };
            pending_message(container, cause)
        }
        PodIssue::Failing { message } => format!("Pod is in failed state due to: {message}"),
        PodIssue::OomKilled { container } => {
            format!("Pod is in failed state as container: {container} was OOMKilled")
        }
        PodIssue::CrashLoopBackOff { container, message } => {
            let mut rendered = format!(
                "Pod is in failed state as container: {container} is in CrashLoopBackOff"
            );
            if !message.is_empty() {
                rendered.push_str(": ");
                rendered.push_str(message);
            }
            rendered
        }
        PodIssue::ProcessExited {
            container,
            exit_code,
        } => format!(
            "Pod is in failed state as container: {container} exited with code {exit_code}"
        ),
    }
}

fn pending_message(container: &str, cause: &str) -> String {
    format!("Pod is in pending state as container: {container} is not running due to: {cause}")
}

/// Deletion guard message of the Telemetry resource
pub fn blocks_deletion_message(blocking: &[(&str, Vec<String>)]) -> String {
    let resources = blocking
        .iter()
        .filter(|(_, names)| !names.is_empty())
        .map(|(kind, names)| format!("{kind}s ({})", names.join(",")))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "The deletion of the module is blocked. To unblock the deletion, delete the following resources: {resources}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SecretKeyRef;

    #[test]
    fn test_unknown_reason_is_empty() {
        assert_eq!(reason_message("SomethingNew", Signal::Logs), "");
    }

    #[test]
    fn test_rollout_message() {
        assert_eq!(
            reason_message(REASON_ROLLOUT_IN_PROGRESS, Signal::Metrics),
            "Pods are being started/updated"
        );
    }

    #[test]
    fn test_components_running() {
        assert_eq!(
            reason_message(REASON_COMPONENTS_RUNNING, Signal::Traces),
            "All trace components are running"
        );
    }

    #[test]
    fn test_no_logs_delivered_message() {
        assert_eq!(
            reason_message(REASON_SELF_MON_NO_LOGS_DELIVERED, Signal::Logs),
            "Backend is not reachable or rejecting logs. Logs are buffered and not yet dropped"
        );
    }

    #[test]
    fn test_image_pull_backoff_names_container() {
        let message = pod_issue_message(&PodIssue::ImagePullBackOff {
            container: "collector".to_string(),
            message: "Back-off pulling image \"foo:bar\"".to_string(),
        });
        assert_eq!(
            message,
            "Pod is in pending state as container: collector is not running due to: Back-off pulling image \"foo:bar\""
        );
    }

    #[test]
    fn test_pending_falls_back_to_reason() {
        let message = pod_issue_message(&PodIssue::Pending {
            container: "collector".to_string(),
            reason: "CreateContainerConfigError".to_string(),
            message: String::new(),
        });
        assert!(message.ends_with("due to: CreateContainerConfigError"));
    }

    #[test]
    fn test_ready_and_configured_messages() {
        assert_eq!(
            ready_message(Signal::Logs, Component::Agent),
            "Log agent DaemonSet is ready"
        );
        assert_eq!(
            configured_message(Signal::Metrics, Component::Gateway),
            "Metric gateway successfully configured"
        );
    }

    #[test]
    fn test_tls_messages() {
        let expired = DateTime::parse_from_rfc3339("2020-11-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            tls_message(&TlsError::CertificateExpired(expired)),
            "TLS certificate expired on 2020-11-01"
        );
        assert_eq!(
            about_to_expire_message(Expiring::Certificate, &expired),
            "TLS certificate is about to expire on 2020-11-01"
        );
        assert_eq!(
            about_to_expire_message(Expiring::Ca, &expired),
            "TLS CA certificate is about to expire on 2020-11-01"
        );
        assert_eq!(
            tls_message(&TlsError::CaCertificateExpired(expired)),
            "TLS CA certificate expired on 2020-11-01"
        );
        assert_eq!(
            tls_message(&TlsError::ConfigurationInvalid(
                "certificate and private key do not match".to_string()
            )),
            "TLS configuration invalid: certificate and private key do not match"
        );
    }

    #[test]
    fn test_secret_missing_names_reference() {
        let message = rejection_message(
            &Rejection::ReferencedSecretMissing(SecretKeyRef {
                name: "log-secret".to_string(),
                namespace: "default".to_string(),
                key: "host".to_string(),
            }),
            Signal::Logs,
        );
        assert!(message.starts_with("One or more referenced Secrets are missing"));
        assert!(message.contains("log-secret"));
    }

    #[test]
    fn test_blocks_deletion_message() {
        let message = blocks_deletion_message(&[
            ("LogPipeline", vec!["a".to_string(), "b".to_string()]),
            ("TracePipeline", vec![]),
        ]);
        assert_eq!(
            message,
            "The deletion of the module is blocked. To unblock the deletion, delete the following resources: LogPipelines (a,b)"
        );
    }
}
