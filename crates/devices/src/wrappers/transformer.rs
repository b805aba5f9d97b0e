//! Wrappers that rewrite bundles on their way in or out of a device.
//!
//! Input transforms keep the inner device's transaction: committing the
//! transformed result commits the original message.

use std::{sync::Arc, time::Duration};

use {async_trait::async_trait, tracing::warn};

use crate::{
    device::{InputDevice, OutputDevice},
    error::Result,
    manager::{InputDeviceManager, OutputDeviceManager},
    message::MessageBundle,
    transaction::ReadResult,
};

/// Rewrites bundles read from an input device.
#[async_trait]
pub trait InputTransformer: Send + Sync {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Pure transformation of one read bundle.
    fn transform_input(&self, device: &str, bundle: MessageBundle) -> Result<MessageBundle>;
}

/// Rewrites bundles before they reach an output device.
#[async_trait]
pub trait OutputTransformer: Send + Sync {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn transform_output(&self, device: &str, bundle: &MessageBundle) -> Result<MessageBundle>;
}

/// Adapts a closure into an [`InputTransformer`].
pub struct FnInputTransformer<F>(pub F);

impl<F> FnInputTransformer<F>
where
    F: Fn(&str, MessageBundle) -> Result<MessageBundle> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> InputTransformer for FnInputTransformer<F>
where
    F: Fn(&str, MessageBundle) -> Result<MessageBundle> + Send + Sync,
{
    fn transform_input(&self, device: &str, bundle: MessageBundle) -> Result<MessageBundle> {
        (self.0)(device, bundle)
    }
}

/// Adapts a closure into an [`OutputTransformer`].
pub struct FnOutputTransformer<F>(pub F);

impl<F> FnOutputTransformer<F>
where
    F: Fn(&str, &MessageBundle) -> Result<MessageBundle> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> OutputTransformer for FnOutputTransformer<F>
where
    F: Fn(&str, &MessageBundle) -> Result<MessageBundle> + Send + Sync,
{
    fn transform_output(&self, device: &str, bundle: &MessageBundle) -> Result<MessageBundle> {
        (self.0)(device, bundle)
    }
}

// ── Input ───────────────────────────────────────────────────────────────────

pub struct TransformerInputDevice {
    inner: Arc<dyn InputDevice>,
    transformer: Arc<dyn InputTransformer>,
}

impl TransformerInputDevice {
    pub fn new(inner: Arc<dyn InputDevice>, transformer: Arc<dyn InputTransformer>) -> Self {
        Self { inner, transformer }
    }
}

#[async_trait]
impl InputDevice for TransformerInputDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn read_message(&self, timeout: Duration) -> Result<Option<ReadResult>> {
        let Some(result) = self.inner.read_message(timeout).await? else {
            return Ok(None);
        };
        let (bundle, transaction) = result.into_parts();
        match self.transformer.transform_input(self.name(), bundle) {
            Ok(bundle) => Ok(Some(ReadResult::from_parts(bundle, transaction))),
            Err(e) => {
                // The message never reaches a handler, so hand it back now.
                if let Err(rb) = transaction.rollback().await {
                    warn!(device = self.name(), error = %rb, "rollback after failed transform failed");
                }
                Err(e)
            },
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct TransformerInputDeviceManager {
    inner: Arc<dyn InputDeviceManager>,
    transformer: Arc<dyn InputTransformer>,
}

impl TransformerInputDeviceManager {
    pub fn new(inner: Arc<dyn InputDeviceManager>, transformer: Arc<dyn InputTransformer>) -> Self {
        Self { inner, transformer }
    }
}

#[async_trait]
impl InputDeviceManager for TransformerInputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await?;
        self.transformer.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        let transformer = self.transformer.disconnect().await;
        let inner = self.inner.disconnect().await;
        transformer.and(inner)
    }

    async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>> {
        let inner = self.inner.create_input_device(name).await?;
        Ok(Arc::new(TransformerInputDevice::new(
            inner,
            Arc::clone(&self.transformer),
        )))
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

pub struct TransformerOutputDevice {
    inner: Arc<dyn OutputDevice>,
    transformer: Arc<dyn OutputTransformer>,
}

impl TransformerOutputDevice {
    pub fn new(inner: Arc<dyn OutputDevice>, transformer: Arc<dyn OutputTransformer>) -> Self {
        Self { inner, transformer }
    }
}

#[async_trait]
impl OutputDevice for TransformerOutputDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send_message(&self, bundle: &MessageBundle) -> Result<()> {
        let transformed = self.transformer.transform_output(self.name(), bundle)?;
        self.inner.send_message(&transformed).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct TransformerOutputDeviceManager {
    inner: Arc<dyn OutputDeviceManager>,
    transformer: Arc<dyn OutputTransformer>,
}

impl TransformerOutputDeviceManager {
    pub fn new(inner: Arc<dyn OutputDeviceManager>, transformer: Arc<dyn OutputTransformer>) -> Self {
        Self { inner, transformer }
    }
}

#[async_trait]
impl OutputDeviceManager for TransformerOutputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await?;
        self.transformer.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        let transformer = self.transformer.disconnect().await;
        let inner = self.inner.disconnect().await;
        transformer.and(inner)
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        let inner = self.inner.create_output_device(name).await?;
        Ok(Arc::new(TransformerOutputDevice::new(
            inner,
            Arc::clone(&self.transformer),
        )))
    }
}
