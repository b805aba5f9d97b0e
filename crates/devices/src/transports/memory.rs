//! In-process queues. No persistence; for tests, demos and single-process
//! pipelines.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{sync::Notify, time::Instant},
    tracing::debug,
};

use crate::{
    device::{InputDevice, OutputDevice},
    error::{Error, Result},
    manager::{InputDeviceManager, OutputDeviceManager},
    message::{Message, MessageBundle},
    transaction::{InputTransaction, ReadResult},
};

/// Device header carrying how many times the message has been read.
pub const DELIVERY_COUNT_HEADER: &str = "delivery_count";

/// Per-queue counters, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub sent: u64,
    pub read: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<Entry>,
    stats: QueueStats,
}

#[derive(Debug)]
struct Shared {
    queues: Mutex<HashMap<String, Queue>>,
    notify: Notify,
    available: AtomicBool,
}

impl Shared {
    fn with_queue<T>(&self, name: &str, f: impl FnOnce(&mut Queue) -> T) -> T {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        f(queues.entry(name.to_string()).or_default())
    }

    fn ensure_available(&self, device: &str) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::transport(device, "in-memory transport unavailable"))
        }
    }
}

/// Named FIFO queues shared by every device this manager creates.
///
/// Devices with the same name share one queue, so an output device named
/// `"q"` feeds the input device named `"q"`. Rolled-back messages go back to
/// the front of their queue.
#[derive(Clone)]
pub struct InMemoryDeviceManager {
    shared: Arc<Shared>,
}

impl Default for InMemoryDeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDeviceManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Enqueue a message directly, bypassing any output device.
    pub fn push(&self, queue: &str, message: Message) {
        self.shared.with_queue(queue, |q| {
            q.items.push_back(Entry {
                message,
                deliveries: 0,
            });
        });
        self.shared.notify.notify_waiters();
    }

    pub fn len(&self, queue: &str) -> usize {
        self.shared.with_queue(queue, |q| q.items.len())
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// The message at the front of `queue`, without taking it.
    pub fn peek(&self, queue: &str) -> Option<Message> {
        self.shared
            .with_queue(queue, |q| q.items.front().map(|e| e.message.clone()))
    }

    /// Remove and return everything queued under `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Message> {
        self.shared
            .with_queue(queue, |q| q.items.drain(..).map(|e| e.message).collect())
    }

    pub fn stats(&self, queue: &str) -> QueueStats {
        self.shared.with_queue(queue, |q| q.stats)
    }

    /// Simulate losing (or regaining) the transport. While unavailable every
    /// read and send fails with a transport error.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl InputDeviceManager for InMemoryDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.shared.ensure_available("memory")
    }

    async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>> {
        Ok(Arc::new(InMemoryInputDevice {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl OutputDeviceManager for InMemoryDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.shared.ensure_available("memory")
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        Ok(Arc::new(InMemoryOutputDevice {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct InMemoryInputDevice {
    name: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl InMemoryInputDevice {
    fn try_take(&self) -> Option<ReadResult> {
        let entry = self.shared.with_queue(&self.name, |q| {
            let mut entry = q.items.pop_front()?;
            entry.deliveries += 1;
            q.stats.read += 1;
            Some(entry)
        })?;
        let bundle = MessageBundle::new(entry.message.clone())
            .device_header(DELIVERY_COUNT_HEADER, entry.deliveries);
        Some(ReadResult::new(bundle, MemoryTransaction {
            queue: self.name.clone(),
            shared: Arc::clone(&self.shared),
            entry,
        }))
    }
}

#[async_trait]
impl InputDevice for InMemoryInputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_message(&self, timeout: Duration) -> Result<Option<ReadResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::closed(&self.name));
            }
            self.shared.ensure_available(&self.name)?;

            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take() {
                return Ok(Some(result));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct InMemoryOutputDevice {
    name: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl OutputDevice for InMemoryOutputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, bundle: &MessageBundle) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(&self.name));
        }
        self.shared.ensure_available(&self.name)?;
        self.shared.with_queue(&self.name, |q| {
            q.items.push_back(Entry {
                message: bundle.message.clone(),
                deliveries: 0,
            });
            q.stats.sent += 1;
        });
        self.shared.notify.notify_waiters();
        debug!(device = %self.name, bytes = bundle.message.len(), "message queued");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    queue: String,
    shared: Arc<Shared>,
    entry: Entry,
}

#[async_trait]
impl InputTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.shared.with_queue(&self.queue, |q| q.stats.commits += 1);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self {
            queue,
            shared,
            entry,
        } = *self;
        shared.with_queue(&queue, |q| {
            q.items.push_front(entry);
            q.stats.rollbacks += 1;
        });
        shared.notify.notify_waiters();
        Ok(())
    }
}
