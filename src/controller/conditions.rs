//! Condition types, reason codes and list helpers
//!
//! Reason codes are part of the user-facing contract and must stay stable.

use chrono::{DateTime, Utc};

use crate::crd::Condition;

/// Pipeline condition types, in the order they appear in the status block
pub const CONDITION_TYPE_CONFIGURATION_GENERATED: &str = "ConfigurationGenerated";
pub const CONDITION_TYPE_GATEWAY_HEALTHY: &str = "GatewayHealthy";
pub const CONDITION_TYPE_AGENT_HEALTHY: &str = "AgentHealthy";
pub const CONDITION_TYPE_FLOW_HEALTHY: &str = "TelemetryFlowHealthy";

pub const PIPELINE_CONDITION_ORDER: [&str; 4] = [
    CONDITION_TYPE_CONFIGURATION_GENERATED,
    CONDITION_TYPE_GATEWAY_HEALTHY,
    CONDITION_TYPE_AGENT_HEALTHY,
    CONDITION_TYPE_FLOW_HEALTHY,
];

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

// Configuration
pub const REASON_GATEWAY_CONFIGURED: &str = "GatewayConfigured";
pub const REASON_AGENT_CONFIGURED: &str = "AgentConfigured";
pub const REASON_REFERENCED_SECRET_MISSING: &str = "ReferencedSecretMissing";
pub const REASON_MAX_PIPELINES_EXCEEDED: &str = "MaxPipelinesExceeded";
pub const REASON_ENDPOINT_INVALID: &str = "EndpointInvalid";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_TLS_CONFIGURATION_INVALID: &str = "TLSConfigurationInvalid";
pub const REASON_TLS_CERTIFICATE_INVALID: &str = "TLSCertificateInvalid";
pub const REASON_TLS_PRIVATE_KEY_INVALID: &str = "TLSPrivateKeyInvalid";
pub const REASON_TLS_CERTIFICATE_EXPIRED: &str = "TLSCertificateExpired";
pub const REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE: &str = "TLSCertificateAboutToExpire";

// Workloads
pub const REASON_GATEWAY_READY: &str = "GatewayReady";
pub const REASON_AGENT_READY: &str = "AgentReady";
pub const REASON_GATEWAY_NOT_REQUIRED: &str = "GatewayNotRequired";
pub const REASON_AGENT_NOT_REQUIRED: &str = "AgentNotRequired";
pub const REASON_DEPLOYMENT_NOT_READY: &str = "DeploymentNotReady";
pub const REASON_DAEMONSET_NOT_READY: &str = "DaemonSetNotReady";
pub const REASON_ROLLOUT_IN_PROGRESS: &str = "RolloutInProgress";

// Flow
pub const REASON_SELF_MON_FLOW_HEALTHY: &str = "SelfMonFlowHealthy";
pub const REASON_SELF_MON_ALL_DATA_DROPPED: &str = "SelfMonAllDataDropped";
pub const REASON_SELF_MON_SOME_DATA_DROPPED: &str = "SelfMonSomeDataDropped";
pub const REASON_SELF_MON_BUFFER_FILLING_UP: &str = "SelfMonBufferFillingUp";
pub const REASON_SELF_MON_NO_LOGS_DELIVERED: &str = "SelfMonNoLogsDelivered";
pub const REASON_SELF_MON_GATEWAY_THROTTLING: &str = "SelfMonGatewayThrottling";
pub const REASON_SELF_MON_NO_CONSUMER_GATEWAY_THROTTLING: &str =
    "SelfMonNoConsumerGatewayThrottling";
pub const REASON_SELF_MON_CONFIG_NOT_GENERATED: &str = "SelfMonConfigNotGenerated";
pub const REASON_SELF_MON_PROBING_FAILED: &str = "SelfMonProbingFailed";

// Telemetry resource
pub const REASON_COMPONENTS_RUNNING: &str = "ComponentsRunning";
pub const REASON_NO_PIPELINE_DEPLOYED: &str = "NoPipelineDeployed";
pub const REASON_RESOURCE_BLOCKS_DELETION: &str = "ResourceBlocksDeletion";

/// Build a condition with the given transition time
pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time: now.to_rfc3339(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
    }
}

/// Carry over transition times from `previous` for conditions whose
/// status and reason did not change.
pub fn preserve_transition_times(desired: &mut [Condition], previous: &[Condition]) {
    for condition in desired.iter_mut() {
        if let Some(old) = find_condition(previous, &condition.type_) {
            if old.status == condition.status && old.reason == condition.reason {
                condition.last_transition_time = old.last_transition_time.clone();
            }
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Compare two condition lists ignoring transition timestamps
pub fn conditions_equivalent(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.type_ == y.type_
                && x.status == y.status
                && x.reason == y.reason
                && x.message == y.message
                && x.observed_generation == y.observed_generation
        })
}
