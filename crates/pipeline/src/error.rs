/// Crate-wide result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device failure the loop cannot recover from.
    #[error(transparent)]
    Device(#[from] flowline_devices::Error),

    /// The service configuration cannot work (no input devices, zero timeouts).
    #[error("invalid pipeline configuration: {message}")]
    InvalidConfig { message: String },

    /// `start` was called on a service that already ran.
    #[error("service '{service}' cannot start from state {state}")]
    AlreadyStarted { service: String, state: String },

    /// The handler failed to connect or disconnect.
    #[error("handler {stage} failed: {message}")]
    HandlerLifecycle {
        stage: &'static str,
        message: String,
    },
}

impl Error {
    #[must_use]
    pub fn invalid_config(message: impl std::fmt::Display) -> Self {
        Self::InvalidConfig {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn handler_lifecycle(stage: &'static str, err: &anyhow::Error) -> Self {
        Self::HandlerLifecycle {
            stage,
            message: format!("{err:#}"),
        }
    }
}
