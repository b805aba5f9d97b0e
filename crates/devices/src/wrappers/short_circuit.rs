//! Stop calling a device for a while after it fails repeatedly.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::time::Instant,
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use flowline_metrics::{counter, devices as dev_metrics, gauge, labels};

use crate::{
    device::{InputDevice, OutputDevice},
    error::{Error, Result},
    manager::{InputDeviceManager, OutputDeviceManager},
    message::MessageBundle,
    transaction::ReadResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortCircuitPolicy {
    /// Consecutive failures that open the circuit.
    pub fail_count: u32,
    /// How long the circuit stays open.
    pub cooldown: Duration,
}

impl Default for ShortCircuitPolicy {
    fn default() -> Self {
        Self {
            fail_count: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Failure counter shared by the input and output variants.
#[derive(Debug)]
pub struct Circuit {
    device: String,
    policy: ShortCircuitPolicy,
    state: Mutex<CircuitState>,
}

impl Circuit {
    pub fn new(device: impl Into<String>, policy: ShortCircuitPolicy) -> Self {
        Self {
            device: device.into(),
            policy,
            state: Mutex::new(CircuitState::default()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }

    fn remaining(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let until = state.open_until?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    /// Refuse the call while open.
    fn check(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = state.open_until {
            let now = Instant::now();
            if now < until {
                #[cfg(feature = "metrics")]
                counter!(dev_metrics::SHORT_CIRCUIT_REJECTIONS_TOTAL, labels::DEVICE => self.device.clone())
                    .increment(1);
                return Err(Error::ShortCircuited {
                    device: self.device.clone(),
                    remaining: until - now,
                });
            }
            state.open_until = None;
            #[cfg(feature = "metrics")]
            gauge!(dev_metrics::SHORT_CIRCUITS_OPEN).decrement(1.0);
            info!(device = %self.device, "short circuit closed");
        }
        Ok(())
    }

    fn record<T>(&self, outcome: &Result<T>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if outcome.is_ok() {
            state.consecutive_failures = 0;
            return;
        }
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.policy.fail_count {
            state.consecutive_failures = 0;
            state.open_until = Some(Instant::now() + self.policy.cooldown);
            #[cfg(feature = "metrics")]
            gauge!(dev_metrics::SHORT_CIRCUITS_OPEN).increment(1.0);
            warn!(
                device = %self.device,
                cooldown = ?self.policy.cooldown,
                "short circuit opened after repeated failures"
            );
        }
    }
}

// ── Input ───────────────────────────────────────────────────────────────────

pub struct ShortCircuitInputDevice {
    inner: Arc<dyn InputDevice>,
    circuit: Circuit,
}

impl ShortCircuitInputDevice {
    pub fn new(inner: Arc<dyn InputDevice>, policy: ShortCircuitPolicy) -> Self {
        let circuit = Circuit::new(inner.name(), policy);
        Self { inner, circuit }
    }

    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }
}

#[async_trait]
impl InputDevice for ShortCircuitInputDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn read_message(&self, timeout: Duration) -> Result<Option<ReadResult>> {
        self.circuit.check()?;
        let res = self.inner.read_message(timeout).await;
        self.circuit.record(&res);
        res
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct ShortCircuitInputDeviceManager {
    inner: Arc<dyn InputDeviceManager>,
    policy: ShortCircuitPolicy,
}

impl ShortCircuitInputDeviceManager {
    pub fn new(inner: Arc<dyn InputDeviceManager>, policy: ShortCircuitPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl InputDeviceManager for ShortCircuitInputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>> {
        let inner = self.inner.create_input_device(name).await?;
        Ok(Arc::new(ShortCircuitInputDevice::new(inner, self.policy)))
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

pub struct ShortCircuitOutputDevice {
    inner: Arc<dyn OutputDevice>,
    circuit: Circuit,
}

impl ShortCircuitOutputDevice {
    pub fn new(inner: Arc<dyn OutputDevice>, policy: ShortCircuitPolicy) -> Self {
        let circuit = Circuit::new(inner.name(), policy);
        Self { inner, circuit }
    }

    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }
}

#[async_trait]
impl OutputDevice for ShortCircuitOutputDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send_message(&self, bundle: &MessageBundle) -> Result<()> {
        self.circuit.check()?;
        let res = self.inner.send_message(bundle).await;
        self.circuit.record(&res);
        res
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct ShortCircuitOutputDeviceManager {
    inner: Arc<dyn OutputDeviceManager>,
    policy: ShortCircuitPolicy,
}

impl ShortCircuitOutputDeviceManager {
    pub fn new(inner: Arc<dyn OutputDeviceManager>, policy: ShortCircuitPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl OutputDeviceManager for ShortCircuitOutputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        let inner = self.inner.create_output_device(name).await?;
        Ok(Arc::new(ShortCircuitOutputDevice::new(inner, self.policy)))
    }
}
