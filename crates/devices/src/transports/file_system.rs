//! Directory-backed queues.
//!
//! Layout under `root`:
//!
//! ```text
//! root/<device>/<file>            queued messages
//! root/<device>/POISON/<file>     messages rolled back too many times
//! root/.inflight/<device>/<file>  messages claimed by a reader
//! root/.tmp/<file>                partially written messages
//! ```
//!
//! A reader claims a file by renaming it into `.inflight`, so competing
//! processes never read the same file. Commit deletes the claimed file,
//! rollback renames it back. Files hold a JSON header line, a newline, then
//! the raw body.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    tokio::{fs, time::Instant},
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use flowline_metrics::{counter, devices as dev_metrics, labels};

use crate::{
    device::{InputDevice, OutputDevice},
    error::{Context, Error, Result},
    manager::{InputDeviceManager, OutputDeviceManager},
    message::{Headers, Message, MessageBundle},
    transaction::{InputTransaction, ReadResult},
};

const INFLIGHT_DIR: &str = ".inflight";
const TMP_DIR: &str = ".tmp";
const POISON_DIR: &str = "POISON";

/// Device header with the path the message was read from.
pub const FILE_PATH_HEADER: &str = "file_path";
/// Device header with how many times this file was rolled back before.
pub const ROLLBACK_COUNT_HEADER: &str = "rollback_count";

#[derive(Debug, Clone)]
pub struct FileSystemOptions {
    /// Rollbacks after which a file is moved to `POISON` instead of requeued.
    pub max_rollbacks: u32,
    /// Read oldest files first (by modification time). Otherwise files are
    /// taken in name order, which is cheaper for large directories.
    pub fifo: bool,
    /// Sleep between directory scans while a read is waiting.
    pub poll_interval: Duration,
}

impl Default for FileSystemOptions {
    fn default() -> Self {
        Self {
            max_rollbacks: 3,
            fifo: true,
            poll_interval: Duration::from_millis(100),
        }
    }
}

// ── Encoding ────────────────────────────────────────────────────────────────

pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(message.headers())?;
    out.push(b'\n');
    out.extend_from_slice(message.bytes());
    Ok(out)
}

pub fn decode_message(raw: &[u8]) -> Result<Message> {
    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .context("message file has no header line")?;
    let headers: Headers = serde_json::from_slice(&raw[..split])?;
    Ok(Message::with_headers_map(raw[split + 1..].to_vec(), headers))
}

// ── Manager ─────────────────────────────────────────────────────────────────

struct Shared {
    root: PathBuf,
    options: FileSystemOptions,
    /// Rollback counts keyed by original file path. Per process: a restart
    /// forgets them.
    rollbacks: Mutex<HashMap<PathBuf, u32>>,
}

impl Shared {
    fn queue_dir(&self, device: &str) -> PathBuf {
        self.root.join(device)
    }

    fn inflight_dir(&self, device: &str) -> PathBuf {
        self.root.join(INFLIGHT_DIR).join(device)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }
}

#[derive(Clone)]
pub struct FileSystemDeviceManager {
    shared: Arc<Shared>,
}

impl FileSystemDeviceManager {
    pub fn new(root: impl Into<PathBuf>, options: FileSystemOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                root: root.into(),
                options,
                rollbacks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Move messages left in `.inflight` by a crashed reader back to their
    /// queues. Only safe while no reader is running against `root`.
    pub async fn recover_inflight(&self) -> Result<usize> {
        let inflight = self.shared.root.join(INFLIGHT_DIR);
        let mut recovered = 0;
        let mut devices = match fs::read_dir(&inflight).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(dev_entry) = devices.next_entry().await? {
            if !dev_entry.file_type().await?.is_dir() {
                continue;
            }
            let device = dev_entry.file_name().to_string_lossy().into_owned();
            let queue = self.shared.queue_dir(&device);
            fs::create_dir_all(&queue)
                .await
                .with_context(|| format!("create {}", queue.display()))?;
            let mut files = fs::read_dir(dev_entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                fs::rename(file.path(), queue.join(file.file_name()))
                    .await
                    .with_context(|| format!("recover {}", file.path().display()))?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(root = %self.shared.root.display(), recovered, "recovered in-flight messages");
        }
        Ok(recovered)
    }

    async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(self.shared.tmp_dir())
            .await
            .map_err(|e| Error::construction(self.shared.root.display().to_string(), e))
    }
}

#[async_trait]
impl InputDeviceManager for FileSystemDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.ensure_root().await
    }

    async fn create_input_device(&self, name: &str) -> Result<Arc<dyn InputDevice>> {
        validate_device_name(name)?;
        for dir in [self.shared.queue_dir(name), self.shared.inflight_dir(name)] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::construction(name, e))?;
        }
        Ok(Arc::new(FileSystemInputDevice {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[async_trait]
impl OutputDeviceManager for FileSystemDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.ensure_root().await
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        validate_device_name(name)?;
        fs::create_dir_all(self.shared.queue_dir(name))
            .await
            .map_err(|e| Error::construction(name, e))?;
        fs::create_dir_all(self.shared.tmp_dir())
            .await
            .map_err(|e| Error::construction(name, e))?;
        Ok(Arc::new(FileSystemOutputDevice {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

fn validate_device_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name == POISON_DIR;
    if bad {
        return Err(Error::construction(
            name,
            "file-system device names must be plain directory names",
        ));
    }
    Ok(())
}

fn unique_file_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{nanos:024}-{}.msg", uuid::Uuid::new_v4().simple())
}

// ── Output ──────────────────────────────────────────────────────────────────

pub struct FileSystemOutputDevice {
    name: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl OutputDevice for FileSystemOutputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    /// Write to `.tmp` then rename into the queue, so readers never see a
    /// partial file.
    async fn send_message(&self, bundle: &MessageBundle) -> Result<()> {
        let encoded = encode_message(&bundle.message)?;
        let file_name = unique_file_name();
        let tmp = self.shared.tmp_dir().join(&file_name);
        let dest = self.shared.queue_dir(&self.name).join(&file_name);

        fs::write(&tmp, &encoded)
            .await
            .map_err(|e| Error::transport(&self.name, format!("write {}: {e}", tmp.display())))?;
        if let Err(e) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::transport(
                &self.name,
                format!("publish {}: {e}", dest.display()),
            ));
        }
        debug!(device = %self.name, file = %file_name, "message written");
        Ok(())
    }
}

// ── Input ───────────────────────────────────────────────────────────────────

pub struct FileSystemInputDevice {
    name: String,
    shared: Arc<Shared>,
}

impl FileSystemInputDevice {
    async fn candidates(&self) -> Result<Vec<PathBuf>> {
        let dir = self.shared.queue_dir(&self.name);
        let mut rd = fs::read_dir(&dir)
            .await
            .map_err(|e| Error::transport(&self.name, format!("list {}: {e}", dir.display())))?;
        let mut files = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let Ok(meta) = entry.metadata().await else {
                continue; // claimed by someone else mid-scan
            };
            if !meta.is_file() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let modified = if self.shared.options.fifo {
                meta.modified().ok()
            } else {
                None
            };
            files.push((modified, entry.path()));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }

    async fn try_claim(&self) -> Result<Option<ReadResult>> {
        for original in self.candidates().await? {
            let Some(file_name) = original.file_name() else {
                continue;
            };
            let claimed = self.shared.inflight_dir(&self.name).join(file_name);
            match fs::rename(&original, &claimed).await {
                Ok(()) => {},
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::transport(
                        &self.name,
                        format!("claim {}: {e}", original.display()),
                    ));
                },
            }
            let raw = read_claimed(&self.name, &claimed, &original).await?;
            let message = match decode_message(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!(device = %self.name, file = %original.display(), error = %e, "unreadable message file");
                    poison(&self.name, &claimed, &original).await?;
                    continue;
                },
            };
            let rollbacks = self
                .shared
                .rollbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&original)
                .copied()
                .unwrap_or(0);
            let bundle = MessageBundle::new(message)
                .device_header(FILE_PATH_HEADER, original.display().to_string())
                .device_header(ROLLBACK_COUNT_HEADER, rollbacks);
            return Ok(Some(ReadResult::new(bundle, FileTransaction {
                device: self.name.clone(),
                shared: Arc::clone(&self.shared),
                original,
                claimed,
            })));
        }
        Ok(None)
    }
}

/// Reads a claimed file, returning it to the queue when the read fails.
async fn read_claimed(device: &str, claimed: &Path, original: &Path) -> Result<Vec<u8>> {
    match fs::read(claimed).await {
        Ok(raw) => Ok(raw),
        Err(e) => {
            if let Err(back) = fs::rename(claimed, original).await {
                warn!(device, file = %claimed.display(), error = %back, "could not release claimed file");
            }
            Err(Error::transport(device, format!("read {}: {e}", claimed.display())))
        },
    }
}

#[async_trait]
impl InputDevice for FileSystemInputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_message(&self, timeout: Duration) -> Result<Option<ReadResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.try_claim().await? {
                return Ok(Some(result));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.shared.options.poll_interval.min(deadline - now)).await;
        }
    }
}

async fn poison(device: &str, claimed: &Path, original: &Path) -> Result<()> {
    let Some(queue) = original.parent() else {
        return Err(Error::transport(device, "message file has no parent directory"));
    };
    let poison_dir = queue.join(POISON_DIR);
    fs::create_dir_all(&poison_dir)
        .await
        .with_context(|| format!("create {}", poison_dir.display()))?;
    let name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dest = poison_dir.join(format!("{}-{name}", uuid::Uuid::new_v4().simple()));
    fs::rename(claimed, &dest)
        .await
        .with_context(|| format!("poison {}", claimed.display()))?;
    #[cfg(feature = "metrics")]
    counter!(dev_metrics::POISONED_TOTAL, labels::DEVICE => device.to_string()).increment(1);
    warn!(device, file = %dest.display(), "message moved to poison folder");
    Ok(())
}

struct FileTransaction {
    device: String,
    shared: Arc<Shared>,
    original: PathBuf,
    claimed: PathBuf,
}

#[async_trait]
impl InputTransaction for FileTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.shared
            .rollbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.original);
        match fs::remove_file(&self.claimed).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::transport(&self.device, format!("commit: {e}"))),
        }
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let poisoned = {
            let mut counts = self.shared.rollbacks.lock().unwrap_or_else(|e| e.into_inner());
            let count = counts.entry(self.original.clone()).or_insert(0);
            *count += 1;
            let reached = *count >= self.shared.options.max_rollbacks;
            if reached {
                counts.remove(&self.original);
            }
            reached
        };
        if poisoned {
            return poison(&self.device, &self.claimed, &self.original).await;
        }
        fs::rename(&self.claimed, &self.original)
            .await
            .map_err(|e| Error::transport(&self.device, format!("rollback: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    fn manager(dir: &tempfile::TempDir, max_rollbacks: u32) -> FileSystemDeviceManager {
        FileSystemDeviceManager::new(dir.path(), FileSystemOptions {
            max_rollbacks,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        })
    }

    #[test]
    fn encoding_keeps_headers_and_binary_body() {
        let msg = Message::new(vec![0u8, 10, 255, 10]).header("k", json!({"a": [1, 2]}));
        let back = decode_message(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn decode_rejects_missing_header_line() {
        let err = decode_message(b"no newline here").unwrap_err();
        assert!(matches!(err, Error::Message(ref m) if m == "message file has no header line"));
    }

    #[tokio::test]
    async fn written_message_is_read_and_commit_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, 3);
        InputDeviceManager::connect(&mgr).await.unwrap();
        let out = mgr.create_output_device("jobs").await.unwrap();
        let input = mgr.create_input_device("jobs").await.unwrap();

        out.send_message(&MessageBundle::new(Message::new("payload").header("id", 7)))
            .await
            .unwrap();
        let r = input
            .read_message(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.bundle().message.bytes(), b"payload");
        assert_eq!(r.bundle().message.get_header("id"), Some(&json!(7)));
        // claimed files are invisible to other readers
        assert!(input.read_message(Duration::ZERO).await.unwrap().is_none());

        r.commit().await.unwrap();
        let mut left = std::fs::read_dir(dir.path().join("jobs")).unwrap();
        assert!(left.next().is_none());
    }

    #[tokio::test]
    async fn rollback_requeues_until_poisoned() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, 2);
        let out = mgr.create_output_device("q").await.unwrap();
        let input = mgr.create_input_device("q").await.unwrap();
        out.send_message(&MessageBundle::new(Message::new("bad")))
            .await
            .unwrap();

        let first = input.read_message(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.bundle().device_headers[ROLLBACK_COUNT_HEADER], json!(0));
        first.rollback().await.unwrap();

        let second = input.read_message(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.bundle().device_headers[ROLLBACK_COUNT_HEADER], json!(1));
        second.rollback().await.unwrap();

        assert!(input.read_message(Duration::ZERO).await.unwrap().is_none());
        let poisoned = std::fs::read_dir(dir.path().join("q").join(POISON_DIR))
            .unwrap()
            .count();
        assert_eq!(poisoned, 1);
    }

    #[tokio::test]
    async fn fifo_reads_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, 3);
        let out = mgr.create_output_device("q").await.unwrap();
        for body in ["one", "two", "three"] {
            out.send_message(&MessageBundle::new(Message::new(body)))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        let input = mgr.create_input_device("q").await.unwrap();
        let mut seen = Vec::new();
        while let Some(r) = input.read_message(Duration::ZERO).await.unwrap() {
            seen.push(String::from_utf8(r.bundle().message.bytes().to_vec()).unwrap());
            r.commit().await.unwrap();
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn recover_inflight_returns_claimed_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, 3);
        let out = mgr.create_output_device("q").await.unwrap();
        let input = mgr.create_input_device("q").await.unwrap();
        out.send_message(&MessageBundle::new(Message::new("x")))
            .await
            .unwrap();
        let claimed = input.read_message(Duration::ZERO).await.unwrap().unwrap();
        // simulate a crash: the claim is never resolved
        std::mem::forget(claimed);

        assert_eq!(mgr.recover_inflight().await.unwrap(), 1);
        let again = input.read_message(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.bundle().message.bytes(), b"x");
        again.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_like_device_names() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, 3);
        for name in ["", "../x", ".hidden", "a/b", "POISON"] {
            assert!(matches!(
                mgr.create_input_device(name).await,
                Err(Error::Construction { .. })
            ));
        }
    }

    #[tokio::test]
    async fn failed_read_returns_the_claim_to_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("msg-1");
        // a directory cannot be read as a file
        let claimed = dir.path().join("claimed-msg-1");
        std::fs::create_dir(&claimed).unwrap();

        let err = read_claimed("q", &claimed, &original).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(original.exists());
        assert!(!claimed.exists());
    }
}
