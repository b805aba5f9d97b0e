//! Capability traits implemented by transports and wrappers.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::Result,
    message::MessageBundle,
    transaction::ReadResult,
};

/// Device header set on every read bundle: the name of the input device the
/// message came from.
pub const INPUT_DEVICE_NAME_HEADER: &str = "__INPUT_DEVICE_NAME__";

/// A named source of messages.
#[async_trait]
pub trait InputDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Wait up to `timeout` for a message.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Connection loss and
    /// other transport failures must be returned as errors, never as `None`.
    async fn read_message(&self, timeout: Duration) -> Result<Option<ReadResult>>;

    /// Release transport resources. Called once by the owning manager.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A named sink for messages.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one bundle. Device headers are the transport options.
    ///
    /// Safe to call repeatedly. Failures are returned, never dropped.
    async fn send_message(&self, bundle: &MessageBundle) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
