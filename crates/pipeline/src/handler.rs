//! Pipeline handlers: what to do with each message read by the service.

use std::{future::Future, pin::Pin, sync::Arc};

use {
    anyhow::Result,
    async_trait::async_trait,
    flowline_devices::{InputDevice, MessageBundle},
};

/// What a handler wants sent: zero or more bundles for one output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub output_device_name: String,
    pub bundles: Vec<MessageBundle>,
}

impl PipelineResult {
    pub fn new(output_device_name: impl Into<String>, bundles: Vec<MessageBundle>) -> Self {
        Self {
            output_device_name: output_device_name.into(),
            bundles,
        }
    }

    pub fn single(output_device_name: impl Into<String>, bundle: MessageBundle) -> Self {
        Self::new(output_device_name, vec![bundle])
    }
}

/// Processing unit invoked once per message.
///
/// Returning `Ok(None)` drops the message (it is still committed). Returning
/// an error rolls it back; redelivery is left to the transport.
#[async_trait]
pub trait PipelineHandler: Send + Sync {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn handle_message(
        &self,
        input_device: &dyn InputDevice,
        bundle: &MessageBundle,
    ) -> Result<Option<PipelineResult>>;

    /// Input devices this handler expects to be fed from. A service built
    /// without an explicit device list uses these.
    fn input_devices(&self) -> Vec<String> {
        Vec::new()
    }

    /// Output devices known before the first message. The service creates
    /// them at startup so a bad name or missing output transport fails fast.
    fn output_devices(&self) -> Vec<String> {
        Vec::new()
    }
}

// ── Fixed router ────────────────────────────────────────────────────────────

/// Forwards every message, unchanged, to one output device.
///
/// Device headers from the read are not forwarded; they describe the input
/// transport, not options for the output.
#[derive(Debug, Clone)]
pub struct FixedRouterPipelineHandler {
    output_device_name: String,
}

impl FixedRouterPipelineHandler {
    pub fn new(output_device_name: impl Into<String>) -> Self {
        Self {
            output_device_name: output_device_name.into(),
        }
    }

    pub fn output_device_name(&self) -> &str {
        &self.output_device_name
    }
}

#[async_trait]
impl PipelineHandler for FixedRouterPipelineHandler {
    async fn handle_message(
        &self,
        _input_device: &dyn InputDevice,
        bundle: &MessageBundle,
    ) -> Result<Option<PipelineResult>> {
        Ok(Some(PipelineResult::single(
            self.output_device_name.clone(),
            bundle.forwarded(),
        )))
    }

    fn output_devices(&self) -> Vec<String> {
        vec![self.output_device_name.clone()]
    }
}

// ── Closure handler ─────────────────────────────────────────────────────────

/// Input handed to a [`FnPipelineHandler`] closure.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub device: String,
    pub bundle: MessageBundle,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<PipelineResult>>> + Send>>;

/// Async closure invoked per message.
pub type HandlerFn = Arc<dyn Fn(HandlerInput) -> HandlerFuture + Send + Sync>;

/// Custom handler backed by a closure.
#[derive(Clone)]
pub struct FnPipelineHandler {
    func: HandlerFn,
    input_devices: Vec<String>,
    output_devices: Vec<String>,
}

impl FnPipelineHandler {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(HandlerInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<PipelineResult>>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input: HandlerInput| -> HandlerFuture { Box::pin(func(input)) }),
            input_devices: Vec::new(),
            output_devices: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_input_devices(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.input_devices = names.into_iter().map(Into::into).collect();
        self
    }

    /// Outputs the closure is known to route to; created at service start.
    #[must_use]
    pub fn with_output_devices(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.output_devices = names.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl PipelineHandler for FnPipelineHandler {
    async fn handle_message(
        &self,
        input_device: &dyn InputDevice,
        bundle: &MessageBundle,
    ) -> Result<Option<PipelineResult>> {
        (self.func)(HandlerInput {
            device: input_device.name().to_string(),
            bundle: bundle.clone(),
        })
        .await
    }

    fn input_devices(&self) -> Vec<String> {
        self.input_devices.clone()
    }

    fn output_devices(&self) -> Vec<String> {
        self.output_devices.clone()
    }
}
