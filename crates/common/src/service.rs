//! Service lifecycle contract shared by the pipeline service and the process runner.

use std::fmt;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

/// Lifecycle of a long-running service.
///
/// Transitions only move forward: `Created → Running → Stopping → Stopped`.
/// A service that fails during startup goes straight to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl ServiceState {
    /// Whether the service has started and not yet finished.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Something that can be started and stopped from signal-handling glue.
///
/// `start` resolves only once the service has stopped. `stop` never blocks and
/// may be called any number of times, from any task.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Run until stopped. Errors are failures the supervisor should see.
    async fn start(&self) -> anyhow::Result<()>;

    /// Request shutdown. Idempotent.
    fn stop(&self);

    fn state(&self) -> ServiceState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_and_stopping_are_active() {
        assert!(!ServiceState::Created.is_active());
        assert!(ServiceState::Running.is_active());
        assert!(ServiceState::Stopping.is_active());
        assert!(!ServiceState::Stopped.is_active());
    }

    #[test]
    fn display_is_lowercase_name() {
        assert_eq!(ServiceState::Stopping.to_string(), "stopping");
        assert_eq!(ServiceState::Created.to_string(), "created");
    }
}
