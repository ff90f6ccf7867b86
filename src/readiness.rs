//! Node readiness interpretation.
//!
//! Derives an effective ready/unready verdict from the kubelet-reported
//! `Ready` condition and the taints the control plane and the autoscaler
//! place on nodes. The registry classifies nodes into buckets on top of
//! this verdict.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;

/// Taint placed by the autoscaler on nodes scheduled for removal.
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";

/// Taint kept on a node until its kubelet first reports `Ready`.
pub const NOT_READY_TAINT: &str = "node.kubernetes.io/not-ready";

/// Taint placed on nodes the control plane has lost contact with.
pub const UNREACHABLE_TAINT: &str = "node.kubernetes.io/unreachable";

/// Whether the node carries a taint with the given key.
pub fn has_taint(node: &Node, key: &str) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .map(|taints| taints.iter().any(|taint| taint.key == key))
        .unwrap_or(false)
}

/// Whether the node is being drained for removal by the autoscaler.
pub fn has_to_be_deleted_taint(node: &Node) -> bool {
    has_taint(node, TO_BE_DELETED_TAINT)
}

/// Whether the node still carries the kubelet startup taint.
pub fn has_not_ready_taint(node: &Node) -> bool {
    has_taint(node, NOT_READY_TAINT)
}

/// Whether the node should be treated as ready for autoscaling purposes.
///
/// A `Ready=True` condition is overridden by the startup and
/// unreachability taints: the scheduler cannot place pods there yet, so
/// the autoscaler must not count the node as serving either.
pub fn is_node_ready(node: &Node) -> bool {
    if has_taint(node, NOT_READY_TAINT) || has_taint(node, UNREACHABLE_TAINT) {
        return false;
    }
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|condition| condition.status == "True")
        .unwrap_or(false)
}

/// The node's creation time; nodes without one are treated as ancient so
/// they never pass for freshly started.
pub fn creation_time(node: &Node) -> DateTime<Utc> {
    node.metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// The node's provider-assigned instance id, if the kubelet registered one.
pub fn provider_id(node: &Node) -> Option<&str> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .filter(|id| !id.is_empty())
}

/// The node's name; empty for malformed input.
pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or("")
}
