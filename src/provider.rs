//! Cloud provider interface consumed by the cluster state registry.
//!
//! The registry never owns node groups. It reaches the provider through
//! these traits and keys all of its own bookkeeping by [`NodeGroup::id`],
//! so provider implementations are free to cache, refresh or rebuild their
//! group handles without the registry noticing.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;

/// Errors returned by cloud provider implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider does not support the requested capability. Callers fall
    /// back to an alternative detection path instead of failing.
    #[error("not implemented by cloud provider")]
    NotImplemented,

    /// The provider call failed; retrying on a later cycle may succeed.
    #[error("cloud provider call failed: {0}")]
    Transient(String),
}

/// A single cloud instance backing (or about to back) a cluster node.
///
/// Matched against `Node.spec.providerID` during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Provider-assigned identifier.
    pub id: String,
}

/// A set of identical worker machines controlled by the provider's
/// autoscaling API.
pub trait NodeGroup: Send + Sync {
    /// Stable identifier for the group.
    fn id(&self) -> String;

    /// Smallest size the group may be scaled to.
    fn min_size(&self) -> usize;

    /// Largest size the group may be scaled to.
    fn max_size(&self) -> usize;

    /// Size the provider is currently converging towards.
    fn target_size(&self) -> Result<usize, ProviderError>;

    /// Current instance listing for the group.
    ///
    /// May return [`ProviderError::NotImplemented`], in which case the
    /// registry degrades unregistered-node and cloud-deletion detection to
    /// the paths that do not need a listing.
    fn instances(&self) -> Result<Vec<Instance>, ProviderError>;
}

/// The provider-side view of the managed cluster.
pub trait CloudProvider: Send + Sync {
    /// All node groups the autoscaler manages.
    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>>;

    /// The group a node belongs to, or `None` for nodes outside any
    /// autoscaled group.
    fn node_group_for_node(&self, node: &Node) -> Option<Arc<dyn NodeGroup>>;

    /// Whether the node still has a backing cloud instance.
    ///
    /// Optional capability: implementations without a cheap lookup return
    /// [`ProviderError::NotImplemented`] and the registry infers removal
    /// from the drain taint instead.
    fn has_instance(&self, node: &Node) -> Result<bool, ProviderError>;
}
