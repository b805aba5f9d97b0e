//! The dispatch loop: poll input devices, run the handler, route results,
//! then commit or roll back.
//!
//! Devices are polled round-robin, each with the same bounded timeout, and
//! each pass starts one device further along so no device is always first.
//! Only one message is handled at a time. Stopping is cooperative: the
//! current read (bounded by `poll_timeout`) and any messages already read
//! finish before devices are closed.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    flowline_common::{Observable, Service, ServiceState},
    flowline_devices::{
        BatchReader, DeviceManager, Error as DeviceError, INPUT_DEVICE_NAME_HEADER, InputDevice,
        ReadResult,
    },
    futures::FutureExt,
    tokio::{
        sync::{Mutex, watch},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use flowline_metrics::{counter, histogram, labels, pipeline as pl_metrics};

use crate::{
    error::{Error, Result},
    handler::{PipelineHandler, PipelineResult},
    signal::shutdown_signal,
};

#[derive(Debug, Clone)]
pub struct PipelineServiceConfig {
    pub name: String,
    /// Devices to poll. Empty means "ask the handler".
    pub input_devices: Vec<String>,
    /// How long each device read may wait for a message.
    pub poll_timeout: Duration,
    /// Pause after a pass that found nothing. Zero just yields.
    pub idle_backoff: Duration,
    pub max_batch_read_count: usize,
    pub wait_for_batch_count: bool,
    /// Pause after a pass in which a device failed without being fatal.
    pub loop_failure_backoff: Duration,
    /// Stop on SIGINT / SIGTERM.
    pub stop_on_signal: bool,
}

impl Default for PipelineServiceConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".into(),
            input_devices: Vec::new(),
            poll_timeout: Duration::from_secs(1),
            idle_backoff: Duration::ZERO,
            max_batch_read_count: 1,
            wait_for_batch_count: false,
            loop_failure_backoff: Duration::from_secs(1),
            stop_on_signal: false,
        }
    }
}

/// Summary of one pass over the input devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    pub duration: Duration,
    /// Messages handled and committed.
    pub messages: usize,
    /// Messages rolled back because the handler failed.
    pub handler_failures: usize,
    /// Device error seen during the pass, if any.
    pub error: Option<String>,
}

impl LoopMetrics {
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.handler_failures > 0
    }

    pub fn is_idle(&self) -> bool {
        self.messages == 0 && !self.is_failure()
    }
}

/// Cloneable control surface for a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ServiceState>,
}

impl ServiceHandle {
    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Wait until the service reaches `target` (or a later state).
    pub async fn wait_for(&mut self, target: ServiceState) {
        let rank = |s: ServiceState| s as u8;
        let _ = self.state.wait_for(|s| rank(*s) >= rank(target)).await;
    }
}

pub struct PipelineService {
    config: PipelineServiceConfig,
    handler: Arc<dyn PipelineHandler>,
    devices: Mutex<Option<DeviceManager>>,
    cancel: CancellationToken,
    state_tx: watch::Sender<ServiceState>,
    state_events: Observable<ServiceState>,
    loop_events: Observable<LoopMetrics>,
}

impl PipelineService {
    pub fn new(
        config: PipelineServiceConfig,
        handler: Arc<dyn PipelineHandler>,
        devices: DeviceManager,
    ) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::Created);
        Self {
            config,
            handler,
            devices: Mutex::new(Some(devices)),
            cancel: CancellationToken::new(),
            state_tx,
            state_events: Observable::new(),
            loop_events: Observable::new(),
        }
    }

    pub fn config(&self) -> &PipelineServiceConfig {
        &self.config
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            cancel: self.cancel.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    /// Fired on every state transition.
    pub fn state_events(&self) -> &Observable<ServiceState> {
        &self.state_events
    }

    /// Fired after every pass over the input devices.
    pub fn loop_events(&self) -> &Observable<LoopMetrics> {
        &self.loop_events
    }

    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(service = %self.config.name, "stop requested");
            self.cancel.cancel();
        }
    }

    /// Run until stopped or until a fatal device error.
    ///
    /// Device or handler construction problems fail here, before any message
    /// is read. Devices are always closed before this returns.
    pub async fn run(&self) -> Result<()> {
        let mut devices = match self.devices.lock().await.take() {
            Some(d) => d,
            None => {
                return Err(Error::AlreadyStarted {
                    service: self.config.name.clone(),
                    state: self.state().to_string(),
                });
            },
        };

        let signal_task = self.config.stop_on_signal.then(|| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = shutdown_signal() => cancel.cancel(),
                    () = cancel.cancelled() => {},
                }
            })
        });

        let mut handler_connected = false;
        let outcome = match self.prepare(&mut devices, &mut handler_connected).await {
            Ok(inputs) => {
                self.set_state(ServiceState::Running);
                info!(
                    service = %self.config.name,
                    devices = ?inputs.iter().map(|d| d.name()).collect::<Vec<_>>(),
                    "pipeline service started"
                );
                let res = self.run_loop(&mut devices, &inputs).await;
                self.set_state(ServiceState::Stopping);
                res
            },
            Err(e) => {
                error!(service = %self.config.name, error = %e, "pipeline service failed to start");
                Err(e)
            },
        };

        self.cancel.cancel();
        if handler_connected && let Err(e) = self.handler.disconnect().await {
            warn!(service = %self.config.name, error = %format!("{e:#}"), "handler disconnect failed");
        }
        if let Err(e) = devices.close_all().await {
            warn!(service = %self.config.name, error = %e, "closing devices failed");
        }
        if let Some(task) = signal_task {
            let _ = task.await;
        }
        self.set_state(ServiceState::Stopped);
        match &outcome {
            Ok(()) => info!(service = %self.config.name, "pipeline service stopped"),
            Err(e) => error!(service = %self.config.name, error = %e, "pipeline service failed"),
        }
        outcome
    }

    fn set_state(&self, state: ServiceState) {
        self.state_tx.send_replace(state);
        debug!(service = %self.config.name, %state, "state changed");
        self.state_events.emit(&state);
    }

    async fn prepare(
        &self,
        devices: &mut DeviceManager,
        handler_connected: &mut bool,
    ) -> Result<Vec<Arc<dyn InputDevice>>> {
        if self.config.max_batch_read_count == 0 {
            return Err(Error::invalid_config("max_batch_read_count must be at least 1"));
        }
        let names = if self.config.input_devices.is_empty() {
            self.handler.input_devices()
        } else {
            self.config.input_devices.clone()
        };
        if names.is_empty() {
            return Err(Error::invalid_config(
                "no input devices configured and the handler declares none",
            ));
        }

        devices.connect().await?;
        let mut inputs = Vec::with_capacity(names.len());
        for name in &names {
            inputs.push(devices.get_input_device(name).await?);
        }
        for name in self.handler.output_devices() {
            devices.get_output_device(&name).await?;
        }
        self.handler
            .connect()
            .await
            .map_err(|e| Error::handler_lifecycle("connect", &e))?;
        *handler_connected = true;
        Ok(inputs)
    }

    async fn run_loop(
        &self,
        devices: &mut DeviceManager,
        inputs: &[Arc<dyn InputDevice>],
    ) -> Result<()> {
        let reader = BatchReader::new(
            self.config.max_batch_read_count,
            self.config.wait_for_batch_count,
        );
        let mut start = 0;
        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            let mut metrics = LoopMetrics::default();
            let pass = self
                .run_pass(devices, inputs, start, &reader, &mut metrics)
                .await;
            start = (start + 1) % inputs.len();

            metrics.duration = started.elapsed();
            if let Err(e) = &pass {
                metrics.error = Some(e.to_string());
            }
            #[cfg(feature = "metrics")]
            {
                histogram!(pl_metrics::LOOP_DURATION_SECONDS, labels::SERVICE => self.config.name.clone())
                    .record(metrics.duration.as_secs_f64());
                if metrics.is_failure() {
                    counter!(pl_metrics::LOOP_FAILURES_TOTAL, labels::SERVICE => self.config.name.clone())
                        .increment(1);
                }
            }
            self.loop_events.emit(&metrics);
            pass?;

            if metrics.error.is_some() {
                self.pause(self.config.loop_failure_backoff).await;
            } else if metrics.is_idle() {
                if self.config.idle_backoff.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    self.pause(self.config.idle_backoff).await;
                }
            }
        }
        Ok(())
    }

    async fn run_pass(
        &self,
        devices: &mut DeviceManager,
        inputs: &[Arc<dyn InputDevice>],
        start: usize,
        reader: &BatchReader,
        metrics: &mut LoopMetrics,
    ) -> Result<()> {
        for offset in 0..inputs.len() {
            if self.cancel.is_cancelled() {
                break;
            }
            let device = &inputs[(start + offset) % inputs.len()];
            let batch = match reader
                .read_batch(device.as_ref(), self.config.poll_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(device = device.name(), error = %e, "read failed");
                    metrics.error = Some(e.to_string());
                    continue;
                },
            };

            let mut pending = batch.into_iter();
            while let Some(result) = pending.next() {
                match self.process_message(devices, device, result).await {
                    Ok(true) => metrics.messages += 1,
                    Ok(false) => metrics.handler_failures += 1,
                    Err(e) if e.is_fatal() => {
                        for rest in pending {
                            if let Err(rb) = rest.rollback().await {
                                warn!(device = device.name(), error = %rb, "rollback of unprocessed message failed");
                            }
                        }
                        return Err(e.into());
                    },
                    Err(e) => {
                        warn!(device = device.name(), error = %e, "message rolled back after device failure");
                        metrics.error = Some(e.to_string());
                    },
                }
            }
        }
        Ok(())
    }

    /// Handle one read. Returns `Ok(false)` when the handler failed and the
    /// message was rolled back. Device errors are returned after the message
    /// has been rolled back (or could not be).
    async fn process_message(
        &self,
        devices: &mut DeviceManager,
        device: &Arc<dyn InputDevice>,
        mut result: ReadResult,
    ) -> std::result::Result<bool, DeviceError> {
        result
            .bundle_mut()
            .device_headers
            .entry(INPUT_DEVICE_NAME_HEADER.to_string())
            .or_insert_with(|| device.name().into());

        #[cfg(feature = "metrics")]
        counter!(pl_metrics::MESSAGES_RECEIVED_TOTAL, labels::DEVICE => device.name().to_string())
            .increment(1);
        #[cfg(feature = "metrics")]
        let started = Instant::now();

        let outcome = AssertUnwindSafe(
            self.handler
                .handle_message(device.as_ref(), result.bundle()),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))
        });

        #[cfg(feature = "metrics")]
        histogram!(pl_metrics::HANDLER_DURATION_SECONDS, labels::DEVICE => device.name().to_string())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Err(e) => {
                warn!(device = device.name(), error = %format!("{e:#}"), "handler failed, rolling back");
                #[cfg(feature = "metrics")]
                counter!(pl_metrics::HANDLER_FAILURES_TOTAL, labels::DEVICE => device.name().to_string())
                    .increment(1);
                result.rollback().await?;
                Ok(false)
            },
            Ok(output) => {
                if let Some(output) = output
                    && let Err(e) = self.route(devices, output).await
                {
                    return match result.rollback().await {
                        Ok(()) => Err(e),
                        Err(rb) => Err(DeviceError::aggregated(
                            "send failed and rollback failed",
                            vec![e, rb],
                        )),
                    };
                }
                result.commit().await?;
                #[cfg(feature = "metrics")]
                counter!(pl_metrics::MESSAGES_HANDLED_TOTAL, labels::DEVICE => device.name().to_string())
                    .increment(1);
                Ok(true)
            },
        }
    }

    async fn route(
        &self,
        devices: &mut DeviceManager,
        output: PipelineResult,
    ) -> std::result::Result<(), DeviceError> {
        if output.bundles.is_empty() {
            return Ok(());
        }
        let device = devices.get_output_device(&output.output_device_name).await?;
        for bundle in &output.bundles {
            device.send_message(bundle).await?;
            #[cfg(feature = "metrics")]
            counter!(pl_metrics::MESSAGES_SENT_TOTAL, labels::OUTPUT_DEVICE => output.output_device_name.clone())
                .increment(1);
        }
        debug!(
            output = %output.output_device_name,
            count = output.bundles.len(),
            "routed handler output"
        );
        Ok(())
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            () = self.cancel.cancelled() => {},
            () = tokio::time::sleep(duration) => {},
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

#[async_trait]
impl Service for PipelineService {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.run().await.map_err(anyhow::Error::from)
    }

    fn stop(&self) {
        PipelineService::stop(self);
    }

    fn state(&self) -> ServiceState {
        PipelineService::state(self)
    }
}
