//! Devices backed by a list of inner devices: the first one that succeeds wins.
//!
//! With [`CollectionOrder::RoundRobin`] the list is shuffled once and each call
//! starts one position further along, spreading load across the members.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    rand::seq::SliceRandom,
    tokio::time::Instant,
    tracing::{error, warn},
};

use crate::{
    device::{InputDevice, OutputDevice},
    error::{Error, Result},
    manager::{InputDeviceManager, OutputDeviceManager},
    message::MessageBundle,
    transaction::ReadResult,
};

/// Pause between passes over the members while a read is still waiting.
const SLEEP_BETWEEN_PASSES: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionOrder {
    /// Always try members in the order given.
    #[default]
    Sequential,
    /// Shuffle once, then rotate the starting member on every call.
    RoundRobin,
}

/// Yields member indices in the order a call should try them.
#[derive(Debug)]
struct Cycle {
    order: CollectionOrder,
    cursor: AtomicUsize,
}

impl Cycle {
    fn new(order: CollectionOrder) -> Self {
        Self {
            order,
            cursor: AtomicUsize::new(0),
        }
    }

    fn indices(&self, len: usize) -> impl Iterator<Item = usize> {
        let start = match self.order {
            CollectionOrder::Sequential => 0,
            CollectionOrder::RoundRobin if len > 0 => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % len
            },
            CollectionOrder::RoundRobin => 0,
        };
        (0..len).map(move |i| (start + i) % len)
    }
}

fn arrange<T>(mut items: Vec<T>, order: CollectionOrder) -> Vec<T> {
    if order == CollectionOrder::RoundRobin {
        items.shuffle(&mut rand::rng());
    }
    items
}

// ── Input ───────────────────────────────────────────────────────────────────

pub struct CollectionInputDevice {
    name: String,
    devices: Vec<Arc<dyn InputDevice>>,
    cycle: Cycle,
}

impl CollectionInputDevice {
    pub fn new(
        name: impl Into<String>,
        devices: Vec<Arc<dyn InputDevice>>,
        order: CollectionOrder,
    ) -> Self {
        Self {
            name: name.into(),
            devices: arrange(devices, order),
            cycle: Cycle::new(order),
        }
    }
}

#[async_trait]
impl InputDevice for CollectionInputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    /// Polls each member without waiting until one yields a message, the
    /// deadline passes, or every member fails in the same pass.
    async fn read_message(&self, timeout: Duration) -> Result<Option<ReadResult>> {
        if self.devices.is_empty() {
            return Err(Error::construction(&self.name, "collection has no members"));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let mut failures = Vec::new();
            for idx in self.cycle.indices(self.devices.len()) {
                let device = &self.devices[idx];
                match device.read_message(Duration::ZERO).await {
                    Ok(Some(result)) => return Ok(Some(result)),
                    Ok(None) => {},
                    Err(e) => {
                        warn!(device = %self.name, member = device.name(), error = %e, "member read failed");
                        failures.push(e);
                    },
                }
            }
            if failures.len() == self.devices.len() {
                error!(device = %self.name, "all collection members failed to read");
                return Err(Error::aggregated(
                    format!("reading from collection '{}': all devices failed", self.name),
                    failures,
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(SLEEP_BETWEEN_PASSES.min(deadline - now)).await;
        }
    }

    async fn close(&self) -> Result<()> {
        for device in &self.devices {
            if let Err(e) = device.close().await {
                warn!(device = %self.name, member = device.name(), error = %e, "failed to close member");
            }
        }
        Ok(())
    }
}

/// Builds a [`CollectionInputDevice`] per name from every inner manager.
pub struct CollectionInputDeviceManager {
    managers: Vec<Arc<dyn InputDeviceManager>>,
    order: CollectionOrder,
}

impl CollectionInputDeviceManager {
    pub fn new(managers: Vec<Arc<dyn InputDeviceManager>>, order: CollectionOrder) -> Self {
        Self { managers, order }
    }

    pub fn round_robin(managers: Vec<Arc<dyn InputDeviceManager>>) -> Self {
        Self::new(managers, CollectionOrder::RoundRobin)
    }
}

#[async_trait]
impl InputDeviceManager for CollectionInputDeviceManager {
    /// Succeeds if at least one inner manager connects.
    async fn connect(&self) -> Result<()> {
        let mut failures = Vec::new();
        for m in &self.managers {
            if let Err(e) = m.connect().await {
                warn!(error = %e, "failed to connect collection member manager");
                failures.push(e);
            }
        }
        if !self.managers.is_empty() && failures.len() == self.managers.len() {
            return Err(Error::aggregated("connecting collection managers", failures));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for m in &self.managers {
            if let Err(e) = m.disconnect().await {
                warn!(error = %e, "failed to disconnect collection member manager");
            }
        }
        Ok(())
    }

    async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>> {
        let mut devices = Vec::with_capacity(self.managers.len());
        for m in &self.managers {
            devices.push(m.create_input_device(name).await?);
        }
        Ok(Arc::new(CollectionInputDevice::new(name, devices, self.order)))
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

pub struct CollectionOutputDevice {
    name: String,
    devices: Vec<Arc<dyn OutputDevice>>,
    cycle: Cycle,
}

impl CollectionOutputDevice {
    pub fn new(
        name: impl Into<String>,
        devices: Vec<Arc<dyn OutputDevice>>,
        order: CollectionOrder,
    ) -> Self {
        Self {
            name: name.into(),
            devices: arrange(devices, order),
            cycle: Cycle::new(order),
        }
    }
}

#[async_trait]
impl OutputDevice for CollectionOutputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    /// Sends through the first member that accepts the bundle.
    async fn send_message(&self, bundle: &MessageBundle) -> Result<()> {
        let mut failures = Vec::new();
        for idx in self.cycle.indices(self.devices.len()) {
            let device = &self.devices[idx];
            match device.send_message(bundle).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(device = %self.name, member = device.name(), error = %e, "member send failed");
                    failures.push(e);
                },
            }
        }
        Err(Error::aggregated(
            format!("sending to collection '{}': all devices failed", self.name),
            failures,
        ))
    }

    async fn close(&self) -> Result<()> {
        for device in &self.devices {
            if let Err(e) = device.close().await {
                warn!(device = %self.name, member = device.name(), error = %e, "failed to close member");
            }
        }
        Ok(())
    }
}

pub struct CollectionOutputDeviceManager {
    managers: Vec<Arc<dyn OutputDeviceManager>>,
    order: CollectionOrder,
}

impl CollectionOutputDeviceManager {
    pub fn new(managers: Vec<Arc<dyn OutputDeviceManager>>, order: CollectionOrder) -> Self {
        Self { managers, order }
    }

    pub fn round_robin(managers: Vec<Arc<dyn OutputDeviceManager>>) -> Self {
        Self::new(managers, CollectionOrder::RoundRobin)
    }
}

#[async_trait]
impl OutputDeviceManager for CollectionOutputDeviceManager {
    async fn connect(&self) -> Result<()> {
        let mut failures = Vec::new();
        for m in &self.managers {
            if let Err(e) = m.connect().await {
                warn!(error = %e, "failed to connect collection member manager");
                failures.push(e);
            }
        }
        if !self.managers.is_empty() && failures.len() == self.managers.len() {
            return Err(Error::aggregated("connecting collection managers", failures));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for m in &self.managers {
            if let Err(e) = m.disconnect().await {
                warn!(error = %e, "failed to disconnect collection member manager");
            }
        }
        Ok(())
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        let mut devices = Vec::with_capacity(self.managers.len());
        for m in &self.managers {
            devices.push(m.create_output_device(name).await?);
        }
        Ok(Arc::new(CollectionOutputDevice::new(name, devices, self.order)))
    }
}
