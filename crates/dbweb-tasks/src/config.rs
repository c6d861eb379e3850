use std::time::Duration;

/// Default delay before retrying an update that raced task initialization.
pub const DEFAULT_INIT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    /// How long an update waits before retrying while the task's
    /// initialization request is still in flight.
    pub init_retry_delay: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            init_retry_delay: DEFAULT_INIT_RETRY_DELAY,
        }
    }
}
