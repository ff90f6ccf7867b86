//! Published autoscaler status document.
//!
//! The status is the registry's durable external artifact: an external
//! publisher serializes it into a configuration record for operators, so
//! field names and the condition enumerations are stable.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What a condition describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// Overall health of the scope.
    Health,
    /// Scale-up activity in the scope.
    ScaleUp,
    /// Scale-down candidate selection in the scope.
    ScaleDown,
}

/// Current verdict of a condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// The scope passes its health thresholds.
    Healthy,
    /// The scope fails its health thresholds.
    Unhealthy,
    /// A scale operation is in flight.
    InProgress,
    /// No scale operation is required.
    NotNeeded,
    /// No scale operation is in flight.
    NoActivity,
    /// Scale-down candidates have been selected for the scope.
    CandidatesPresent,
    /// No scale-down candidates intersect the scope.
    NoCandidates,
}

/// One observed condition of the cluster or of a node group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// What this condition describes.
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Current verdict.
    pub status: ConditionStatus,

    /// Human-readable detail backing the verdict.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// When the condition was last evaluated.
    pub last_probe_time: DateTime<Utc>,

    /// When `status` last changed. Preserved across updates while the
    /// verdict is stable.
    pub last_transition_time: DateTime<Utc>,
}

/// Conditions for a single node group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    /// Provider-side identifier of the group.
    pub provider_id: String,

    /// The group's Health, ScaleUp and ScaleDown conditions.
    pub conditions: Vec<Condition>,
}

/// The full status document assembled on every probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerStatus {
    /// Conditions describing the cluster as a whole.
    pub clusterwide_conditions: Vec<Condition>,

    /// Conditions per autoscaled node group.
    pub node_group_statuses: Vec<NodeGroupStatus>,
}

/// Find a condition by type.
pub fn get_condition(
    conditions: &[Condition],
    condition_type: ConditionType,
) -> Option<&Condition> {
    conditions
        .iter()
        .find(|condition| condition.condition_type == condition_type)
}

/// Carry `last_transition_time` forward from `previous` wherever the status
/// of the same `(scope, type)` condition is unchanged.
///
/// Conditions with no counterpart in the previous status (including whole
/// new node groups) keep the transition time they were built with.
pub fn preserve_last_transition_times(
    current: &mut AutoscalerStatus,
    previous: &AutoscalerStatus,
) {
    preserve_in_conditions(
        &mut current.clusterwide_conditions,
        &previous.clusterwide_conditions,
    );
    for group_status in &mut current.node_group_statuses {
        if let Some(previous_group) = previous
            .node_group_statuses
            .iter()
            .find(|candidate| candidate.provider_id == group_status.provider_id)
        {
            preserve_in_conditions(&mut group_status.conditions, &previous_group.conditions);
        }
    }
}

fn preserve_in_conditions(current: &mut [Condition], previous: &[Condition]) {
    for condition in current {
        if let Some(previous_condition) = get_condition(previous, condition.condition_type) {
            if previous_condition.status == condition.status {
                condition.last_transition_time = previous_condition.last_transition_time;
            }
        }
    }
}
