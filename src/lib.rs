//! Cluster state registry for a Kubernetes node-group autoscaler.
//!
//! Autoscaling decisions are unsafe without a precise, reconciled view of
//! three asynchronous realities: nodes as Kubernetes reports them,
//! instances as the cloud provider reports them, and the scale-up and
//! scale-down requests the autoscaler itself has recently issued. This
//! crate fuses those three streams into a consistent in-memory state,
//! tracks per-node-group health, detects timeouts and failures, gates
//! further actions via exponential backoff, and publishes a structured
//! condition report.
//!
//! The central type is [`ClusterStateRegistry`]; cloud access goes through
//! the [`provider::CloudProvider`] trait so providers never depend on the
//! registry.

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod provider;
pub mod readiness;
pub mod registry;
pub mod status;

#[cfg(test)]
pub(crate) mod test_util;

pub use crate::config::{BackoffConfig, ClusterStateConfig};
pub use crate::error::{Error, Result};
pub use crate::registry::ClusterStateRegistry;
