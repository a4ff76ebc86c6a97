//! Lifecycle notifications for the presentation layer.

/// Receives [`FileGuard`](crate::FileGuard) lifecycle notifications.
///
/// Callbacks run on runtime worker threads and should return quickly.
pub trait GuardObserver: Send + Sync {
    /// Monitoring is active: the agent routes requests to this guard.
    fn on_started(&self);

    /// Monitoring was stopped on request.
    fn on_stopped(&self);

    /// Starting, stopping, or the channel itself failed.
    fn on_error(&self, message: &str);
}
