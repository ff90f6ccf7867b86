//! Event sinks for surfacing registry observations to operators.

/// Receives noteworthy cluster-scoped events.
///
/// The registry emits warnings for provider failures, degraded deletion
/// detection and scale-up timeouts. It functions unchanged with
/// [`NoOpRecorder`].
pub trait EventRecorder: Send + Sync {
    /// Record an informational event.
    fn event(&self, reason: &str, message: &str);

    /// Record a warning event.
    fn warning(&self, reason: &str, message: &str);
}

/// Sink that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpRecorder;

impl EventRecorder for NoOpRecorder {
    fn event(&self, _reason: &str, _message: &str) {}

    fn warning(&self, _reason: &str, _message: &str) {}
}
