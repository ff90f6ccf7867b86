//! Error types shared across the crate.

use crate::provider::ProviderError;

/// Errors surfaced by the cluster state registry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The registry was constructed with settings that can never work.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A cloud provider call failed in a way the registry cannot absorb.
    #[error("cloud provider error: {0}")]
    CloudProviderError(#[from] ProviderError),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
