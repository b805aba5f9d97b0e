#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The payload does not match the registered schema.
    #[error("validation failed at {path}: {message}")]
    Validation { path: String, message: String },

    #[error("a callback is already registered for input device '{device}'")]
    DuplicateRoute { device: String },

    #[error("no callback registered for input device '{device}'")]
    MissingRoute { device: String },

    #[error("invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("argument '{name}' is not bound")]
    MissingArgument { name: String },

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn validation(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Validation {
            path: path.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_schema(message: impl std::fmt::Display) -> Self {
        Self::InvalidSchema {
            message: message.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
