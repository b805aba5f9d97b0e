//! The schema-dispatch pipeline handler.

use std::{collections::HashMap, future::Future, sync::Arc};

use {
    async_trait::async_trait,
    flowline_devices::{InputDevice, MessageBundle},
    flowline_pipeline::{PipelineHandler, PipelineResult},
    futures::future::BoxFuture,
    serde::{Serialize, de::DeserializeOwned},
    tracing::{debug, warn},
};

use crate::{
    args::CallArgs,
    error::{Error, Result},
    output::CallbackOutput,
    schema::{FieldType, Schema},
};

/// Parameter name used by [`SchemaDispatchHandler::register_typed`].
pub const TYPED_PAYLOAD_PARAM: &str = "payload";

pub type Callback =
    Arc<dyn Fn(CallArgs) -> BoxFuture<'static, anyhow::Result<CallbackOutput>> + Send + Sync>;

/// Called instead of failing when a payload does not match its schema. The
/// returned result (if any) is routed like a callback's.
pub type ValidationErrorHandler =
    Arc<dyn Fn(&str, &MessageBundle, &Error) -> Option<PipelineResult> + Send + Sync>;

/// Where a route's return values go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputTarget {
    /// The handler's default output device, as set when registering.
    #[default]
    Default,
    Device(String),
    /// Never forward, even when the callback returns something.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RouteOutput {
    Device(String),
    Discard,
    Unmapped,
}

struct Route {
    schema: Schema,
    callback: Callback,
    output: RouteOutput,
}

/// Maps each input device to one callback and the schema its payloads are
/// bound against.
///
/// Routes are registered up front, before the service starts. Dispatch
/// looks up the route by the name of the device the message came from.
pub struct SchemaDispatchHandler {
    default_output_device: Option<String>,
    routes: HashMap<String, Route>,
    validation_error_handler: Option<ValidationErrorHandler>,
}

impl Default for SchemaDispatchHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaDispatchHandler {
    pub fn new() -> Self {
        Self {
            default_output_device: None,
            routes: HashMap::new(),
            validation_error_handler: None,
        }
    }

    /// Routes registered afterwards with [`OutputTarget::Default`] send here.
    #[must_use]
    pub fn with_default_output_device(mut self, name: impl Into<String>) -> Self {
        self.default_output_device = Some(name.into());
        self
    }

    pub fn default_output_device(&self) -> Option<&str> {
        self.default_output_device.as_deref()
    }

    #[must_use]
    pub fn with_validation_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &MessageBundle, &Error) -> Option<PipelineResult> + Send + Sync + 'static,
    {
        self.set_validation_error_handler(handler);
        self
    }

    pub fn set_validation_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&str, &MessageBundle, &Error) -> Option<PipelineResult> + Send + Sync + 'static,
    {
        self.validation_error_handler = Some(Arc::new(handler));
    }

    /// Register `callback` for messages read from `input_device`.
    ///
    /// Fails with [`Error::DuplicateRoute`] if the device already has one.
    pub fn register<F, Fut>(
        &mut self,
        input_device: impl Into<String>,
        output: OutputTarget,
        schema: Schema,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<CallbackOutput>> + Send + 'static,
    {
        let input_device = input_device.into();
        if self.routes.contains_key(&input_device) {
            return Err(Error::DuplicateRoute {
                device: input_device,
            });
        }
        let output = match output {
            OutputTarget::Device(name) => RouteOutput::Device(name),
            OutputTarget::Discard => RouteOutput::Discard,
            OutputTarget::Default => self
                .default_output_device
                .clone()
                .map_or(RouteOutput::Unmapped, RouteOutput::Device),
        };
        debug!(device = %input_device, ?output, params = schema.params().len(), "route registered");
        self.routes.insert(input_device, Route {
            schema,
            callback: Arc::new(move |args: CallArgs| -> BoxFuture<'static, anyhow::Result<CallbackOutput>> {
                Box::pin(callback(args))
            }),
            output,
        });
        Ok(())
    }

    /// Register a callback taking the whole payload as a deserialized `T`
    /// and returning an optional serializable `R`.
    pub fn register_typed<T, R, F, Fut>(
        &mut self,
        input_device: impl Into<String>,
        output: OutputTarget,
        callback: F,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
    {
        let schema = Schema::builder()
            .root(TYPED_PAYLOAD_PARAM, FieldType::Any)
            .build()?;
        let callback = Arc::new(callback);
        self.register(input_device, output, schema, move |args: CallArgs| {
            let callback = Arc::clone(&callback);
            async move {
                let input: T = args.get(TYPED_PAYLOAD_PARAM)?;
                match callback(input).await? {
                    Some(value) => Ok(CallbackOutput::json(&value)?),
                    None => Ok(CallbackOutput::Nothing),
                }
            }
        })
    }

    pub fn input_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schema(&self, input_device: &str) -> Option<&Schema> {
        self.routes.get(input_device).map(|r| &r.schema)
    }

    /// Bind, invoke and serialize for one message read from `device`.
    pub async fn dispatch(
        &self,
        device: &str,
        bundle: &MessageBundle,
    ) -> anyhow::Result<Option<PipelineResult>> {
        let route = self.routes.get(device).ok_or_else(|| Error::MissingRoute {
            device: device.to_string(),
        })?;

        let called = match route.schema.bind(device, bundle) {
            Ok(args) => (route.callback)(args).await,
            Err(e) => Err(e.into()),
        };
        let output = match called {
            Ok(output) => output,
            Err(e) => return self.on_error(device, bundle, e),
        };
        if output.is_nothing() {
            return Ok(None);
        }

        let bundles = output.into_bundles()?;
        match &route.output {
            RouteOutput::Device(name) => Ok(Some(PipelineResult::new(name.clone(), bundles))),
            RouteOutput::Discard => Ok(None),
            RouteOutput::Unmapped => {
                warn!(
                    device,
                    "callback returned a value but no output device is mapped, dropping it"
                );
                Ok(None)
            },
        }
    }

    fn on_error(
        &self,
        device: &str,
        bundle: &MessageBundle,
        err: anyhow::Error,
    ) -> anyhow::Result<Option<PipelineResult>> {
        if let Some(handler) = &self.validation_error_handler
            && let Some(validation) = err.downcast_ref::<Error>()
            && validation.is_validation()
        {
            debug!(device, error = %validation, "payload failed validation, using error handler");
            return Ok(handler(device, bundle, validation));
        }
        Err(err)
    }
}

#[async_trait]
impl PipelineHandler for SchemaDispatchHandler {
    async fn handle_message(
        &self,
        input_device: &dyn InputDevice,
        bundle: &MessageBundle,
    ) -> anyhow::Result<Option<PipelineResult>> {
        self.dispatch(input_device.name(), bundle).await
    }

    fn input_devices(&self) -> Vec<String> {
        SchemaDispatchHandler::input_devices(self)
    }

    fn output_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .values()
            .filter_map(|route| match &route.output {
                RouteOutput::Device(name) => Some(name.clone()),
                RouteOutput::Discard | RouteOutput::Unmapped => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
