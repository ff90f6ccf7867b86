//! Prometheus metrics for the cluster state registry.
//!
//! # Exported metrics
//! When built with `--features metrics` the following metrics are
//! registered:
//! - `autoscaler_nodes_count` (gauge): cluster nodes labeled by readiness state.
//! - `autoscaler_unregistered_nodes` (gauge): cloud instances with no cluster node.
//! - `autoscaler_failed_scale_ups_total` (counter): failed scale-ups labeled by reason.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::registry::Readiness;

/// Labels for the node count metric
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeStateLabels {
    /// Readiness bucket, e.g. "ready"
    pub state: String,
}

/// Labels for the failed scale-up counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    /// Failure class, e.g. "timeout"
    pub reason: String,
}

/// Gauge tracking cluster nodes per readiness state
pub static NODES_COUNT: Lazy<Family<NodeStateLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge tracking cloud instances that have not registered as nodes
pub static UNREGISTERED_NODES: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Counter tracking failed scale-ups by reason
pub static FAILED_SCALE_UPS_TOTAL: Lazy<Family<FailureLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "autoscaler_nodes_count",
        "Number of cluster nodes per readiness state",
        NODES_COUNT.clone(),
    );
    registry.register(
        "autoscaler_unregistered_nodes",
        "Number of cloud instances that have not registered as cluster nodes",
        UNREGISTERED_NODES.clone(),
    );
    registry.register(
        "autoscaler_failed_scale_ups_total",
        "Total number of failed scale-ups by reason",
        FAILED_SCALE_UPS_TOTAL.clone(),
    );

    registry
});

fn set_node_count(state: &str, count: usize) {
    let labels = NodeStateLabels {
        state: state.to_string(),
    };
    NODES_COUNT.get_or_create(&labels).set(count as i64);
}

/// Publish the readiness view computed by the last reconciliation.
pub fn observe_cluster_state(readiness: &Readiness, unregistered: usize) {
    set_node_count("ready", readiness.ready.len());
    set_node_count("unready", readiness.unready.len());
    set_node_count("notStarted", readiness.not_started.len());
    set_node_count("longUnregistered", readiness.long_unregistered.len());
    set_node_count("deleted", readiness.deleted.len());
    UNREGISTERED_NODES.set(unregistered as i64);
}

/// Increment the failed scale-up counter.
pub fn inc_failed_scale_up(reason: &str) {
    let labels = FailureLabels {
        reason: reason.to_string(),
    };
    FAILED_SCALE_UPS_TOTAL.get_or_create(&labels).inc();
}
