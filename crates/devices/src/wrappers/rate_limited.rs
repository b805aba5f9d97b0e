//! Sliding-window rate limiting for devices.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use {async_trait::async_trait, tokio::time::Instant, tracing::debug};

#[cfg(feature = "metrics")]
use flowline_metrics::{devices as dev_metrics, histogram};

use crate::{
    device::{InputDevice, OutputDevice},
    error::{Error, Result},
    manager::{InputDeviceManager, OutputDeviceManager},
    message::MessageBundle,
    transaction::ReadResult,
};

/// Allows at most `actions` calls in any window of length `per`.
///
/// One limiter may be shared by several devices; the window then applies to
/// their combined traffic.
#[derive(Debug)]
pub struct RateLimiter {
    actions: usize,
    per: Duration,
    history: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(actions: usize, per: Duration) -> Result<Self> {
        if actions == 0 {
            return Err(Error::construction(
                "rate limiter",
                "must allow at least one action per window",
            ));
        }
        Ok(Self {
            actions,
            per,
            history: Mutex::new(VecDeque::with_capacity(actions)),
        })
    }

    /// How long [`RateLimiter::acquire`] would wait if called now.
    pub fn expected_wait(&self) -> Duration {
        let now = Instant::now();
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        self.wait_locked(&mut history, now)
    }

    fn wait_locked(&self, history: &mut VecDeque<Instant>, now: Instant) -> Duration {
        while let Some(&oldest) = history.front() {
            if now.duration_since(oldest) >= self.per {
                history.pop_front();
            } else {
                break;
            }
        }
        if history.len() < self.actions {
            return Duration::ZERO;
        }
        history
            .front()
            .map(|&oldest| self.per.saturating_sub(now.duration_since(oldest)))
            .unwrap_or_default()
    }

    /// Wait for a slot and take it.
    ///
    /// With `max_wait` set, gives up (returning `false`, no slot taken) when
    /// the required wait is longer; it still sleeps for `max_wait` so callers
    /// polling in a loop do not spin.
    pub async fn acquire(&self, max_wait: Option<Duration>) -> bool {
        let started = Instant::now();
        loop {
            let wait = {
                let now = Instant::now();
                let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
                let wait = self.wait_locked(&mut history, now);
                if wait.is_zero() {
                    history.push_back(now);
                    #[cfg(feature = "metrics")]
                    histogram!(dev_metrics::RATE_LIMIT_WAIT_SECONDS)
                        .record(started.elapsed().as_secs_f64());
                    return true;
                }
                wait
            };
            if let Some(max) = max_wait {
                let left = max.saturating_sub(started.elapsed());
                if left < wait {
                    debug!(?wait, "rate limited past the allowed wait");
                    tokio::time::sleep(left).await;
                    return false;
                }
            }
            tokio::time::sleep(wait).await;
        }
    }
}

// ── Input ───────────────────────────────────────────────────────────────────

pub struct RateLimitedInputDevice {
    inner: Arc<dyn InputDevice>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedInputDevice {
    pub fn new(inner: Arc<dyn InputDevice>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl InputDevice for RateLimitedInputDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    /// The limiter wait counts against `timeout`; if no slot frees up in
    /// time the read returns `None` without touching the inner device.
    async fn read_message(&self, timeout: Duration) -> Result<Option<ReadResult>> {
        let started = Instant::now();
        if !self.limiter.acquire(Some(timeout)).await {
            return Ok(None);
        }
        let left = timeout.saturating_sub(started.elapsed());
        self.inner.read_message(left).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct RateLimitedInputDeviceManager {
    inner: Arc<dyn InputDeviceManager>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedInputDeviceManager {
    pub fn new(inner: Arc<dyn InputDeviceManager>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl InputDeviceManager for RateLimitedInputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>> {
        let inner = self.inner.create_input_device(name).await?;
        Ok(Arc::new(RateLimitedInputDevice::new(
            inner,
            Arc::clone(&self.limiter),
        )))
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

pub struct RateLimitedOutputDevice {
    inner: Arc<dyn OutputDevice>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedOutputDevice {
    pub fn new(inner: Arc<dyn OutputDevice>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl OutputDevice for RateLimitedOutputDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    /// Sends block until the limiter allows them.
    async fn send_message(&self, bundle: &MessageBundle) -> Result<()> {
        self.limiter.acquire(None).await;
        self.inner.send_message(bundle).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct RateLimitedOutputDeviceManager {
    inner: Arc<dyn OutputDeviceManager>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedOutputDeviceManager {
    pub fn new(inner: Arc<dyn OutputDeviceManager>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl OutputDeviceManager for RateLimitedOutputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        let inner = self.inner.create_output_device(name).await?;
        Ok(Arc::new(RateLimitedOutputDevice::new(
            inner,
            Arc::clone(&self.limiter),
        )))
    }
}
