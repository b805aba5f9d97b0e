#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn instance {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("instance {index} exited unsuccessfully ({status})")]
    ChildFailed { index: usize, status: String },

    #[error("runner is already {state}")]
    AlreadyStarted { state: String },

    #[error("invalid runner configuration: {message}")]
    InvalidConfig { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
