use std::{error::Error as StdError, time::Duration};

use flowline_common::FromMessage;

/// Crate-wide result type for device operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed device errors shared by every transport and wrapper.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device or device manager could not be built (bad name, bad config,
    /// unreachable transport at startup).
    #[error("failed to construct device '{device}': {message}")]
    Construction { device: String, message: String },

    /// The transport behind a device failed (connection loss, I/O failure).
    #[error("transport failure on '{device}': {message}")]
    Transport { device: String, message: String },

    /// Several devices were tried and all of them failed.
    #[error("{context}: {}", render_failures(.failures))]
    Aggregated {
        context: String,
        failures: Vec<Error>,
    },

    /// A short-circuit wrapper is refusing calls.
    #[error("device '{device}' is short-circuited for another {remaining:?}")]
    ShortCircuited { device: String, remaining: Duration },

    /// The payload could not be decoded by a transformer.
    #[error("invalid payload on '{device}': {message}")]
    InvalidPayload { device: String, message: String },

    /// The device was used after `close`.
    #[error("device '{device}' is closed")]
    Closed { device: String },

    /// Wrapped source error from an external dependency.
    #[error("device operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),
}

fn render_failures(failures: &[Error]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    #[must_use]
    pub fn construction(device: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Construction {
            device: device.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn transport(device: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            device: device.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn aggregated(context: impl Into<String>, failures: Vec<Error>) -> Self {
        Self::Aggregated {
            context: context.into(),
            failures,
        }
    }

    #[must_use]
    pub fn invalid_payload(device: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidPayload {
            device: device.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn closed(device: impl Into<String>) -> Self {
        Self::Closed {
            device: device.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error means the service can no longer trust its devices
    /// and should hand control back to its supervisor.
    ///
    /// Per-message problems (a payload a transformer cannot decode) and
    /// temporary refusals (an open short circuit) are not fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ShortCircuited { .. } | Self::InvalidPayload { .. } => false,
            Self::Aggregated { failures, .. } => failures.iter().any(Self::is_fatal),
            _ => true,
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

flowline_common::impl_context!();
