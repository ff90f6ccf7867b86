//! Per-node-group exponential backoff after failed scale-ups.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::BackoffConfig;

#[derive(Clone, Debug)]
struct BackoffEntry {
    duration: chrono::Duration,
    backoff_until: DateTime<Utc>,
    last_failure: DateTime<Utc>,
}

/// Tracks how long each node group must wait before the next scale-up
/// attempt.
///
/// Each failure outside an active window doubles the window up to the
/// configured cap; a failure more than `reset_timeout` after the previous
/// one starts the schedule over. Failures landing inside an active window
/// keep the current duration.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    entries: HashMap<String, BackoffEntry>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Record a failure for the group and return the time until which it is
    /// backed off.
    pub fn backoff(&mut self, group_id: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut duration = self.config.initial_duration;
        if let Some(entry) = self.entries.get(group_id) {
            if entry.backoff_until <= now {
                duration = std::cmp::min(entry.duration * 2, self.config.max_duration);
                if now - entry.last_failure > self.config.reset_timeout {
                    duration = self.config.initial_duration;
                }
            } else {
                duration = entry.duration;
            }
        }
        let backoff_until = now + duration;
        debug!(group = %group_id, until = %backoff_until, "backing off node group");
        self.entries.insert(
            group_id.to_string(),
            BackoffEntry {
                duration,
                backoff_until,
                last_failure: now,
            },
        );
        backoff_until
    }

    /// Whether the group is currently backed off.
    pub fn is_backed_off(&self, group_id: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(group_id)
            .map(|entry| entry.backoff_until > now)
            .unwrap_or(false)
    }

    /// Clear the group's backoff explicitly, e.g. after a successful
    /// scale-up.
    pub fn remove(&mut self, group_id: &str) {
        self.entries.remove(group_id);
    }

    /// Drop bookkeeping for groups whose last failure is older than the
    /// reset timeout.
    pub fn remove_stale(&mut self, now: DateTime<Utc>) {
        let reset_timeout = self.config.reset_timeout;
        self.entries
            .retain(|_, entry| now - entry.last_failure <= reset_timeout);
    }
}
