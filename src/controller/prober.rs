//! Workload readiness prober
//!
//! Answers "is this gateway Deployment or agent DaemonSet ready, and if
//! not, why?". Pod problems are only reported once they outlive
//! [`POD_ISSUE_THRESHOLD_SECS`]; before that they count as a rollout in
//! progress, since Kubernetes restarts containers aggressively during
//! startup.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// How long a pod problem must persist before it is reported
pub const POD_ISSUE_THRESHOLD_SECS: i64 = 5 * 60;

/// Kind of managed workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::DaemonSet => write!(f, "DaemonSet"),
        }
    }
}

/// Verdict of a single probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Ready,
    RolloutInProgress,
    /// The workload object does not exist (yet)
    NotDeployed,
    NotReady(PodIssue),
}

impl ProbeResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeResult::Ready)
    }
}

/// A persistent pod-level problem
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodIssue {
    NotScheduled {
        message: String,
    },
    Pending {
        container: String,
        reason: String,
        message: String,
    },
    ImagePullBackOff {
        container: String,
        message: String,
    },
    Failing {
        message: String,
    },
    OomKilled {
        container: String,
    },
    CrashLoopBackOff {
        container: String,
        message: String,
    },
    ProcessExited {
        container: String,
        exit_code: i32,
    },
}

/// Result of classifying one pod
#[derive(Clone, Debug, PartialEq, Eq)]
enum PodState {
    Healthy,
    Transient,
    Issue(PodIssue),
}

fn older_than(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match since {
        Some(t) => now - t > Duration::seconds(POD_ISSUE_THRESHOLD_SECS),
        None => false,
    }
}

fn pod_started_at(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .map(|t| t.0)
        .or_else(|| pod.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

fn classify_container(
    pod: &Pod,
    status: &ContainerStatus,
    now: DateTime<Utc>,
) -> Option<PodState> {
    let pod_start = pod_started_at(pod);
    let last_terminated = status
        .last_state
        .as_ref()
        .and_then(|s| s.terminated.as_ref());
    let last_started = last_terminated
        .and_then(|t| t.started_at.as_ref())
        .map(|t| t.0)
        .or(pod_start);

    if let Some(waiting) = status.state.as_ref().and_then(|s| s.waiting.as_ref()) {
        let reason = waiting.reason.clone().unwrap_or_default();
        let message = waiting.message.clone().unwrap_or_default();

        return Some(match reason.as_str() {
            "CrashLoopBackOff" => {
                if !older_than(last_started, now) {
                    PodState::Transient
                } else if last_terminated.and_then(|t| t.reason.as_deref()) == Some("OOMKilled") {
                    PodState::Issue(PodIssue::OomKilled {
                        container: status.name.clone(),
                    })
                } else {
                    PodState::Issue(PodIssue::CrashLoopBackOff {
                        container: status.name.clone(),
                        message,
                    })
                }
            }
            "ImagePullBackOff" | "ErrImagePull" => {
                if older_than(pod_start, now) {
                    PodState::Issue(PodIssue::ImagePullBackOff {
                        container: status.name.clone(),
                        message,
                    })
                } else {
                    PodState::Transient
                }
            }
            // Normal while the container is being created
            "ContainerCreating" | "PodInitializing" => PodState::Transient,
            _ => {
                if older_than(pod_start, now) {
                    PodState::Issue(PodIssue::Pending {
                        container: status.name.clone(),
                        reason,
                        message,
                    })
                } else {
                    PodState::Transient
                }
            }
        });
    }

    let terminated = last_terminated?;
    if !older_than(last_started, now) {
        return Some(PodState::Transient);
    }
    match terminated.reason.as_deref() {
        Some("OOMKilled") => Some(PodState::Issue(PodIssue::OomKilled {
            container: status.name.clone(),
        })),
        Some("Error") if terminated.exit_code != 0 => {
            Some(PodState::Issue(PodIssue::ProcessExited {
                container: status.name.clone(),
                exit_code: terminated.exit_code,
            }))
        }
        _ => None,
    }
}

fn classify_pod(pod: &Pod, now: DateTime<Utc>) -> PodState {
    let Some(status) = pod.status.as_ref() else {
        return PodState::Transient;
    };
    let phase = status.phase.as_deref().unwrap_or("Pending");

    if phase == "Failed" {
        let message = status
            .message
            .clone()
            .or_else(|| status.reason.clone())
            .unwrap_or_default();
        return PodState::Issue(PodIssue::Failing { message });
    }

    if phase == "Pending" {
        let unscheduled = status.conditions.as_ref().and_then(|conds| {
            conds
                .iter()
                .find(|c| c.type_ == "PodScheduled" && c.status == "False")
        });
        if let Some(cond) = unscheduled {
            let since = cond
                .last_transition_time
                .as_ref()
                .map(|t| t.0)
                .or_else(|| pod_started_at(pod));
            return if older_than(since, now) {
                PodState::Issue(PodIssue::NotScheduled {
                    message: cond.message.clone().unwrap_or_default(),
                })
            } else {
                PodState::Transient
            };
        }
    }

    let containers = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());

    let mut transient = false;
    for container in containers {
        match classify_container(pod, container, now) {
            Some(PodState::Issue(issue)) => return PodState::Issue(issue),
            Some(PodState::Transient) => transient = true,
            _ => {}
        }
    }

    if transient || phase == "Pending" {
        PodState::Transient
    } else {
        PodState::Healthy
    }
}

/// First persistent issue among the pods, ordered by pod name
fn first_pod_issue(pods: &[Pod], now: DateTime<Utc>) -> Option<PodIssue> {
    let mut sorted: Vec<&Pod> = pods.iter().collect();
    sorted.sort_by_key(|p| p.name_any());
    sorted.into_iter().find_map(|pod| match classify_pod(pod, now) {
        PodState::Issue(issue) => Some(issue),
        _ => None,
    })
}

/// Evaluate a Deployment and its pods
pub fn evaluate_deployment(deployment: &Deployment, pods: &[Pod], now: DateTime<Utc>) -> ProbeResult {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let status = deployment.status.clone().unwrap_or_default();
    if status.observed_generation.unwrap_or(0) < generation {
        return ProbeResult::RolloutInProgress;
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);

    if updated == desired {
        return ProbeResult::Ready;
    }

    match first_pod_issue(pods, now) {
        Some(issue) => ProbeResult::NotReady(issue),
        None => ProbeResult::RolloutInProgress,
    }
}

/// Evaluate a DaemonSet and its pods
///
/// Partial readiness is tolerated: node churn routinely leaves a few
/// agent pods starting up.
pub fn evaluate_daemonset(daemonset: &DaemonSet, pods: &[Pod], now: DateTime<Utc>) -> ProbeResult {
    let generation = daemonset.metadata.generation.unwrap_or(0);
    let status = daemonset.status.clone().unwrap_or_default();
    if status.observed_generation.unwrap_or(0) < generation {
        return ProbeResult::RolloutInProgress;
    }

    if let Some(issue) = first_pod_issue(pods, now) {
        return ProbeResult::NotReady(issue);
    }

    if status.number_ready >= 1 {
        ProbeResult::Ready
    } else {
        ProbeResult::RolloutInProgress
    }
}

fn selector_string(match_labels: Option<&BTreeMap<String, String>>) -> Option<String> {
    let labels = match_labels?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Fetches workloads and their pods and evaluates them
#[derive(Clone)]
pub struct WorkloadProber {
    client: Client,
}

impl WorkloadProber {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn probe(&self, kind: WorkloadKind, name: &str, namespace: &str) -> Result<ProbeResult> {
        match kind {
            WorkloadKind::Deployment => self.probe_deployment(name, namespace).await,
            WorkloadKind::DaemonSet => self.probe_daemonset(name, namespace).await,
        }
    }

    #[instrument(skip(self))]
    pub async fn probe_deployment(&self, name: &str, namespace: &str) -> Result<ProbeResult> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = match api.get_opt(name).await? {
            Some(d) => d,
            None => {
                debug!("Deployment {}/{} not found", namespace, name);
                return Ok(ProbeResult::NotDeployed);
            }
        };
        let selector = deployment
            .spec
            .as_ref()
            .and_then(|s| selector_string(s.selector.match_labels.as_ref()));
        let pods = self.list_pods(namespace, selector).await?;
        Ok(evaluate_deployment(&deployment, &pods, Utc::now()))
    }

    #[instrument(skip(self))]
    pub async fn probe_daemonset(&self, name: &str, namespace: &str) -> Result<ProbeResult> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let daemonset = match api.get_opt(name).await? {
            Some(d) => d,
            None => {
                debug!("DaemonSet {}/{} not found", namespace, name);
                return Ok(ProbeResult::NotDeployed);
            }
        };
        let selector = daemonset
            .spec
            .as_ref()
            .and_then(|s| selector_string(s.selector.match_labels.as_ref()));
        let pods = self.list_pods(namespace, selector).await?;
        Ok(evaluate_daemonset(&daemonset, &pods, Utc::now()))
    }

    async fn list_pods(&self, namespace: &str, selector: Option<String>) -> Result<Vec<Pod>> {
        let Some(selector) = selector else {
            return Err(Error::ConfigError(format!(
                "workload in namespace {namespace} has no label selector"
            )));
        };
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(pods.items)
    }
}
