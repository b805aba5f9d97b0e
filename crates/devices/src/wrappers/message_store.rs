//! Claim-check wrappers: large payloads are parked in a [`MessageStore`] and
//! only a reference travels through the inner device.
//!
//! The reference body is [`MESSAGE_STORE_MAGIC`], the store's own magic, a
//! `|` separator and the store key. Readers swap it back for the stored
//! message. Plain payloads pass through in both directions.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    async_trait::async_trait,
    rand::Rng,
    tokio::fs,
    tracing::{debug, warn},
};

use crate::{
    device::{InputDevice, OutputDevice},
    error::{Context, Error, Result},
    manager::{InputDeviceManager, OutputDeviceManager},
    message::{Message, MessageBundle},
    transaction::{InputTransaction, ReadResult},
    transports::file_system::{decode_message, encode_message},
};

pub const MESSAGE_STORE_MAGIC: &[u8] = b"__MSGSTORE_WRAPPER__";

/// Header set on the reference message: size of the stored payload in bytes.
pub const ORIGINAL_SIZE_HEADER: &str = "__ORIGINAL_MESSAGE_SIZE_HEADER__";

/// Keyed storage for message payloads.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Constant prefix identifying references produced by this store.
    fn magic(&self) -> &[u8];

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Store `message` and return the key that fetches it back.
    async fn put(&self, device: &str, message: &Message) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Message>;

    async fn delete(&self, key: &str) -> Result<()>;
}

fn reference_prefix(store: &dyn MessageStore) -> Vec<u8> {
    let mut prefix = MESSAGE_STORE_MAGIC.to_vec();
    prefix.push(b'|');
    prefix.extend_from_slice(store.magic());
    prefix.push(b'|');
    prefix
}

/// Returns the store key when `data` is a reference written by `store`.
fn parse_reference(store: &dyn MessageStore, data: &[u8]) -> Option<String> {
    let key = data.strip_prefix(reference_prefix(store).as_slice())?;
    Some(String::from_utf8_lossy(key).into_owned())
}

// ── File system store ───────────────────────────────────────────────────────

/// Stores each payload as one file under `root/<bucket>/<uuid>.fsms`.
///
/// Buckets spread files over `buckets` subdirectories. Empty buckets are
/// removed on delete.
pub struct FileSystemMessageStore {
    root: PathBuf,
    buckets: u32,
}

impl FileSystemMessageStore {
    pub const DEFAULT_BUCKETS: u32 = 4000;

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_buckets(root, Self::DEFAULT_BUCKETS)
    }

    pub fn with_buckets(root: impl Into<PathBuf>, buckets: u32) -> Self {
        Self {
            root: root.into(),
            buckets: buckets.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key under `root`, refusing anything that could escape it.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let plain = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(Error::invalid_payload(
                "message-store",
                format!("invalid store key '{key}'"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl MessageStore for FileSystemMessageStore {
    fn magic(&self) -> &[u8] {
        b"__FS_MSGSTORE__"
    }

    async fn connect(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::construction(self.root.display().to_string(), e))
    }

    async fn put(&self, device: &str, message: &Message) -> Result<String> {
        let bucket = rand::rng().random_range(0..self.buckets);
        let key = format!("{bucket:04}/{}.fsms", uuid::Uuid::new_v4().simple());
        let path = self.path_for(&key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::transport(device, format!("create {}: {e}", dir.display())))?;
        }
        fs::write(&path, encode_message(message)?)
            .await
            .map_err(|e| Error::transport(device, format!("store {}: {e}", path.display())))?;
        debug!(device, key = %key, "payload stored");
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Message> {
        let path = self.path_for(key)?;
        let raw = fs::read(&path)
            .await
            .with_context(|| format!("fetch {}", path.display()))?;
        decode_message(&raw)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        fs::remove_file(&path)
            .await
            .with_context(|| format!("delete {}", path.display()))?;
        // Fails while other payloads share the bucket.
        if let Some(dir) = path.parent()
            && dir != self.root.as_path()
        {
            let _ = fs::remove_dir(dir).await;
        }
        Ok(())
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

/// Parks payloads larger than `threshold` bytes in the store and sends a
/// reference instead. `None` stores every payload.
pub struct MessageStoreOutputDevice {
    inner: Arc<dyn OutputDevice>,
    store: Arc<dyn MessageStore>,
    threshold: Option<usize>,
}

impl MessageStoreOutputDevice {
    pub fn new(
        inner: Arc<dyn OutputDevice>,
        store: Arc<dyn MessageStore>,
        threshold: Option<usize>,
    ) -> Self {
        Self {
            inner,
            store,
            threshold,
        }
    }
}

#[async_trait]
impl OutputDevice for MessageStoreOutputDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send_message(&self, bundle: &MessageBundle) -> Result<()> {
        let size = bundle.message.len();
        if self.threshold.is_some_and(|limit| size <= limit) {
            return self.inner.send_message(bundle).await;
        }

        let key = self.store.put(self.name(), &bundle.message).await?;
        let mut data = reference_prefix(self.store.as_ref());
        data.extend_from_slice(key.as_bytes());
        let reference = MessageBundle::with_device_headers(
            bundle
                .message
                .with_data(data)
                .header(ORIGINAL_SIZE_HEADER, size),
            bundle.device_headers.clone(),
        );
        if let Err(e) = self.inner.send_message(&reference).await {
            if let Err(del) = self.store.delete(&key).await {
                warn!(device = self.name(), key = %key, error = %del, "could not remove orphaned payload");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct MessageStoreOutputDeviceManager {
    inner: Arc<dyn OutputDeviceManager>,
    store: Arc<dyn MessageStore>,
    threshold: Option<usize>,
}

impl MessageStoreOutputDeviceManager {
    pub fn new(
        inner: Arc<dyn OutputDeviceManager>,
        store: Arc<dyn MessageStore>,
        threshold: Option<usize>,
    ) -> Self {
        Self {
            inner,
            store,
            threshold,
        }
    }
}

#[async_trait]
impl OutputDeviceManager for MessageStoreOutputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await?;
        self.store.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        let store = self.store.disconnect().await;
        let inner = self.inner.disconnect().await;
        store.and(inner)
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        let inner = self.inner.create_output_device(name).await?;
        Ok(Arc::new(MessageStoreOutputDevice::new(
            inner,
            self.store.clone(),
            self.threshold,
        )))
    }
}

// ── Input ───────────────────────────────────────────────────────────────────

/// Commits the reference, then drops the stored payload.
struct StoredTransaction {
    device: String,
    inner: Box<dyn InputTransaction>,
    store: Arc<dyn MessageStore>,
    key: String,
    delete_on_commit: bool,
}

#[async_trait]
impl InputTransaction for StoredTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await?;
        if self.delete_on_commit
            && let Err(e) = self.store.delete(&self.key).await
        {
            warn!(device = %self.device, key = %self.key, error = %e, "could not delete stored payload");
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

/// Replaces references read from the inner device with the stored message.
pub struct MessageStoreInputDevice {
    inner: Arc<dyn InputDevice>,
    store: Arc<dyn MessageStore>,
    delete_on_commit: bool,
}

impl MessageStoreInputDevice {
    pub fn new(
        inner: Arc<dyn InputDevice>,
        store: Arc<dyn MessageStore>,
        delete_on_commit: bool,
    ) -> Self {
        Self {
            inner,
            store,
            delete_on_commit,
        }
    }
}

#[async_trait]
impl InputDevice for MessageStoreInputDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn read_message(&self, timeout: Duration) -> Result<Option<ReadResult>> {
        let Some(result) = self.inner.read_message(timeout).await? else {
            return Ok(None);
        };
        let Some(key) = parse_reference(self.store.as_ref(), result.bundle().message.bytes())
        else {
            return Ok(Some(result));
        };

        let (bundle, transaction) = result.into_parts();
        let stored = match self.store.get(&key).await {
            Ok(stored) => stored,
            Err(e) => {
                if let Err(rb) = transaction.rollback().await {
                    warn!(device = self.name(), error = %rb, "rollback after failed fetch failed");
                }
                return Err(e);
            },
        };

        // Headers on the reference win over the stored ones.
        let (data, mut headers) = stored.into_parts();
        let (_, reference_headers) = bundle.message.into_parts();
        headers.extend(reference_headers);
        headers.remove(ORIGINAL_SIZE_HEADER);
        let restored = MessageBundle::with_device_headers(
            Message::with_headers_map(data, headers),
            bundle.device_headers,
        );
        Ok(Some(ReadResult::from_parts(
            restored,
            Box::new(StoredTransaction {
                device: self.name().to_string(),
                inner: transaction,
                store: self.store.clone(),
                key,
                delete_on_commit: self.delete_on_commit,
            }),
        )))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct MessageStoreInputDeviceManager {
    inner: Arc<dyn InputDeviceManager>,
    store: Arc<dyn MessageStore>,
    delete_on_commit: bool,
}

impl MessageStoreInputDeviceManager {
    pub fn new(
        inner: Arc<dyn InputDeviceManager>,
        store: Arc<dyn MessageStore>,
        delete_on_commit: bool,
    ) -> Self {
        Self {
            inner,
            store,
            delete_on_commit,
        }
    }
}

#[async_trait]
impl InputDeviceManager for MessageStoreInputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await?;
        self.store.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        let store = self.store.disconnect().await;
        let inner = self.inner.disconnect().await;
        store.and(inner)
    }

    async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>> {
        let inner = self.inner.create_input_device(name).await?;
        Ok(Arc::new(MessageStoreInputDevice::new(
            inner,
            self.store.clone(),
            self.delete_on_commit,
        )))
    }
}
