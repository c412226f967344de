//! Status synthesis
//!
//! Turns the verdicts gathered during a reconcile (validation outcome,
//! workload probes, flow health) into the condition list of a pipeline,
//! and rolls pipeline conditions up into the Telemetry resource.

use chrono::{DateTime, Utc};

use super::conditions::*;
use super::messages::{
    about_to_expire_message, configured_message, not_deployed_message, pod_issue_message,
    ready_message, reason_message, rejection_message,
};
use super::prober::ProbeResult;
use super::resources::Component;
use super::self_monitor::FlowHealth;
use super::validation::Outcome;
use crate::crd::{Condition, Signal, TelemetryState};

/// State of one workload as seen by a pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComponentState {
    NotRequired,
    Probed(ProbeResult),
    /// The workload could not be read
    ProbeFailed(String),
}

/// Everything the synthesizer needs to know about one pipeline
#[derive(Debug)]
pub struct PipelineVerdicts<'a> {
    pub outcome: &'a Outcome,
    /// Component whose configuration the pipeline contributes to
    pub configured: Component,
    pub gateway: ComponentState,
    pub agent: ComponentState,
    pub flow: FlowHealth,
}

fn configuration_condition(
    signal: Signal,
    verdicts: &PipelineVerdicts<'_>,
) -> (&'static str, String, String) {
    match verdicts.outcome {
        Outcome::Reconcilable { tls, .. } => match tls.expiry_warning() {
            Some((expiring, not_after)) => (
                CONDITION_STATUS_TRUE,
                REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE.to_string(),
                about_to_expire_message(expiring, &not_after),
            ),
            None => {
                let reason = match verdicts.configured {
                    Component::Gateway => REASON_GATEWAY_CONFIGURED,
                    Component::Agent => REASON_AGENT_CONFIGURED,
                };
                (
                    CONDITION_STATUS_TRUE,
                    reason.to_string(),
                    configured_message(signal, verdicts.configured),
                )
            }
        },
        Outcome::Rejected(rejection) => (
            CONDITION_STATUS_FALSE,
            rejection.reason().to_string(),
            rejection_message(rejection, signal),
        ),
    }
}

fn component_condition(
    signal: Signal,
    component: Component,
    state: &ComponentState,
) -> (&'static str, String, String) {
    let (ready, not_required, not_ready) = match component {
        Component::Gateway => (
            REASON_GATEWAY_READY,
            REASON_GATEWAY_NOT_REQUIRED,
            REASON_DEPLOYMENT_NOT_READY,
        ),
        Component::Agent => (
            REASON_AGENT_READY,
            REASON_AGENT_NOT_REQUIRED,
            REASON_DAEMONSET_NOT_READY,
        ),
    };
    match state {
        ComponentState::NotRequired => (
            CONDITION_STATUS_TRUE,
            not_required.to_string(),
            reason_message(not_required, signal),
        ),
        ComponentState::Probed(ProbeResult::Ready) => (
            CONDITION_STATUS_TRUE,
            ready.to_string(),
            ready_message(signal, component),
        ),
        ComponentState::Probed(ProbeResult::RolloutInProgress) => (
            CONDITION_STATUS_TRUE,
            REASON_ROLLOUT_IN_PROGRESS.to_string(),
            reason_message(REASON_ROLLOUT_IN_PROGRESS, signal),
        ),
        ComponentState::Probed(ProbeResult::NotDeployed) => (
            CONDITION_STATUS_FALSE,
            not_ready.to_string(),
            not_deployed_message(component),
        ),
        ComponentState::Probed(ProbeResult::NotReady(issue)) => (
            CONDITION_STATUS_FALSE,
            not_ready.to_string(),
            pod_issue_message(issue),
        ),
        ComponentState::ProbeFailed(detail) => (
            CONDITION_STATUS_FALSE,
            not_ready.to_string(),
            format!("Failed to get {}: {detail}", component.workload()),
        ),
    }
}

/// Ordered condition list of a pipeline
///
/// Transition times are carried over from `previous` where status and
/// reason are unchanged. A flow verdict of [`FlowHealth::Unknown`]
/// keeps the previous flow condition, if there is one.
pub fn pipeline_conditions(
    signal: Signal,
    verdicts: &PipelineVerdicts<'_>,
    generation: Option<i64>,
    previous: &[Condition],
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let build = |type_: &str, (status, reason, message): (&str, String, String)| {
        new_condition(type_, status, &reason, &message, generation, now)
    };

    let flow = match (verdicts.flow, find_condition(previous, CONDITION_TYPE_FLOW_HEALTHY)) {
        (FlowHealth::Unknown, Some(kept)) => Condition {
            observed_generation: generation,
            ..kept.clone()
        },
        (health, _) => build(
            CONDITION_TYPE_FLOW_HEALTHY,
            (
                health.status(),
                health.reason().to_string(),
                reason_message(health.reason(), signal),
            ),
        ),
    };

    let mut conditions = vec![
        build(
            CONDITION_TYPE_CONFIGURATION_GENERATED,
            configuration_condition(signal, verdicts),
        ),
        build(
            CONDITION_TYPE_GATEWAY_HEALTHY,
            component_condition(signal, Component::Gateway, &verdicts.gateway),
        ),
        build(
            CONDITION_TYPE_AGENT_HEALTHY,
            component_condition(signal, Component::Agent, &verdicts.agent),
        ),
        flow,
    ];
    preserve_transition_times(&mut conditions, previous);
    conditions
}

/// Whether writing `desired` would change the stored status
pub fn needs_update(current: &[Condition], desired: &[Condition]) -> bool {
    !conditions_equivalent(current, desired)
}

/// Condition type of a signal on the Telemetry resource
pub fn components_condition_type(signal: Signal) -> String {
    format!("{}ComponentsHealthy", signal.title())
}

/// Healthy reasons that still deserve the user's attention
fn is_warning(condition: &Condition) -> bool {
    condition.status == CONDITION_STATUS_TRUE
        && matches!(
            condition.reason.as_str(),
            REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE | REASON_ROLLOUT_IN_PROGRESS
        )
}

/// Roll the conditions of all pipelines of a signal up into one
///
/// The first failing condition wins; without failures the first
/// warning wins. Pipelines are considered in the given order.
pub fn components_condition(
    signal: Signal,
    pipelines: &[&[Condition]],
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> Condition {
    let type_ = components_condition_type(signal);
    if pipelines.is_empty() {
        return new_condition(
            &type_,
            CONDITION_STATUS_TRUE,
            REASON_NO_PIPELINE_DEPLOYED,
            &reason_message(REASON_NO_PIPELINE_DEPLOYED, signal),
            generation,
            now,
        );
    }

    let relevant = [
        CONDITION_TYPE_CONFIGURATION_GENERATED,
        CONDITION_TYPE_GATEWAY_HEALTHY,
        CONDITION_TYPE_AGENT_HEALTHY,
        CONDITION_TYPE_FLOW_HEALTHY,
    ];
    let all = || {
        pipelines.iter().flat_map(|conditions| {
            relevant
                .iter()
                .filter_map(move |t| find_condition(conditions, t))
        })
    };

    let failing = all().find(|c| c.status == CONDITION_STATUS_FALSE);
    let degraded = failing.or_else(|| all().find(|c| is_warning(c)));
    match degraded {
        Some(c) => new_condition(&type_, &c.status, &c.reason, &c.message, generation, now),
        None => new_condition(
            &type_,
            CONDITION_STATUS_TRUE,
            REASON_COMPONENTS_RUNNING,
            &reason_message(REASON_COMPONENTS_RUNNING, signal),
            generation,
            now,
        ),
    }
}

/// Aggregate state of the Telemetry resource
pub fn telemetry_state(conditions: &[Condition]) -> TelemetryState {
    let healthy = conditions.iter().all(|c| {
        c.status == CONDITION_STATUS_TRUE
            && matches!(
                c.reason.as_str(),
                REASON_COMPONENTS_RUNNING | REASON_NO_PIPELINE_DEPLOYED
            )
    });
    if healthy {
        TelemetryState::Ready
    } else {
        TelemetryState::Warning
    }
}
