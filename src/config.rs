//! Registry configuration and validation.

use chrono::Duration;

use crate::error::{Error, Result};

/// Thresholds governing health evaluation, request aging and node
/// classification.
///
/// Validated once by [`crate::ClusterStateRegistry::new`]; the registry
/// refuses to start with settings that can never produce a sane verdict.
#[derive(Clone, Debug)]
pub struct ClusterStateConfig {
    /// The cluster is unhealthy when unready nodes exceed this share of all
    /// nodes (percentage, 0–100).
    pub max_total_unready_percentage: f64,

    /// Absolute unready count below which the cluster is healthy regardless
    /// of the percentage threshold.
    pub ok_total_unready_count: usize,

    /// How long a scale-up may take before it is declared failed. Also the
    /// cutoff after which an unregistered instance counts as
    /// long-unregistered.
    pub max_node_provision_time: Duration,

    /// Window after creation during which an unready node still carrying
    /// the startup taint counts as starting up rather than broken.
    pub max_node_startup_time: Duration,

    /// Per-node-group backoff schedule applied after failed scale-ups.
    pub backoff: BackoffConfig,
}

/// Exponential backoff schedule for node groups with failed scale-ups.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Backoff window after the first failure.
    pub initial_duration: Duration,

    /// Upper bound the window never grows past.
    pub max_duration: Duration,

    /// A failure this long after the previous one starts the schedule over.
    pub reset_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_duration: Duration::minutes(5),
            max_duration: Duration::minutes(30),
            reset_timeout: Duration::hours(3),
        }
    }
}

impl Default for ClusterStateConfig {
    fn default() -> Self {
        Self {
            max_total_unready_percentage: 45.0,
            ok_total_unready_count: 3,
            max_node_provision_time: Duration::minutes(15),
            max_node_startup_time: Duration::minutes(15),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClusterStateConfig {
    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.max_total_unready_percentage) {
            return Err(Error::ConfigError(format!(
                "max_total_unready_percentage must be within 0..=100, got {}",
                self.max_total_unready_percentage
            )));
        }
        if self.max_node_provision_time <= Duration::zero() {
            return Err(Error::ConfigError(
                "max_node_provision_time must be positive".to_string(),
            ));
        }
        if self.max_node_startup_time <= Duration::zero() {
            return Err(Error::ConfigError(
                "max_node_startup_time must be positive".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<()> {
        if self.initial_duration <= Duration::zero() {
            return Err(Error::ConfigError(
                "backoff initial_duration must be positive".to_string(),
            ));
        }
        if self.max_duration < self.initial_duration {
            return Err(Error::ConfigError(
                "backoff max_duration must not be below initial_duration".to_string(),
            ));
        }
        if self.reset_timeout <= Duration::zero() {
            return Err(Error::ConfigError(
                "backoff reset_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
