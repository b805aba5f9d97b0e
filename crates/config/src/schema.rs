//! Configuration schema for a flowline service.
//!
//! Every section has defaults, so an empty file is a valid config.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root of `flowline.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowlineConfig {
    pub service: ServiceConfig,
    pub runner: RunnerConfig,
    pub transport: TransportConfig,
    pub wrappers: WrappersConfig,
}

/// Pipeline service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Devices to poll, in rotation.
    pub input_devices: Vec<String>,
    /// Where the fixed router forwards every message.
    pub output_device: Option<String>,
    /// Per-device read timeout.
    pub poll_timeout_ms: u64,
    pub idle_backoff_ms: u64,
    pub max_batch_read_count: usize,
    pub wait_for_batch_count: bool,
    pub loop_failure_backoff_ms: u64,
    /// Stop the service after this many failed loop passes in a row.
    pub max_consecutive_failures: Option<u32>,
    /// Stop the service when no loop pass finishes for this long.
    pub max_inactivity_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "flowline".into(),
            input_devices: Vec::new(),
            output_device: None,
            poll_timeout_ms: 1000,
            idle_backoff_ms: 0,
            max_batch_read_count: 1,
            wait_for_batch_count: false,
            loop_failure_backoff_ms: 1000,
            max_consecutive_failures: None,
            max_inactivity_secs: None,
        }
    }
}

impl ServiceConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn loop_failure_backoff(&self) -> Duration {
        Duration::from_millis(self.loop_failure_backoff_ms)
    }

    pub fn max_inactivity(&self) -> Option<Duration> {
        self.max_inactivity_secs.map(Duration::from_secs)
    }
}

/// Process runner settings. `instances = 1` runs in-process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub instances: usize,
    pub shutdown_timeout_secs: u64,
    pub restart_on_failure: bool,
    pub restart_backoff_ms: u64,
    /// Liveness check period; unset disables checks.
    pub live_check_interval_secs: Option<u64>,
    pub live_check_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            instances: 1,
            shutdown_timeout_secs: 5,
            restart_on_failure: true,
            restart_backoff_ms: 1000,
            live_check_interval_secs: Some(60),
            live_check_timeout_secs: 10,
        }
    }
}

impl RunnerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn live_check_interval(&self) -> Option<Duration> {
        self.live_check_interval_secs.map(Duration::from_secs)
    }

    pub fn live_check_timeout(&self) -> Duration {
        Duration::from_secs(self.live_check_timeout_secs)
    }
}

/// Which transport backs the device managers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process queues; only useful with a single instance.
    #[default]
    Memory,
    FileSystem(FileSystemTransportConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::FileSystem(_) => "file_system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemTransportConfig {
    pub root: PathBuf,
    /// Rollbacks before a message is moved to `POISON/`.
    pub max_rollbacks: u32,
    /// Read oldest file first.
    pub fifo: bool,
    pub poll_interval_ms: u64,
}

impl Default for FileSystemTransportConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            max_rollbacks: 3,
            fifo: true,
            poll_interval_ms: 100,
        }
    }
}

/// Wrappers applied around every device, innermost first in the order the
/// fields are listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrappersConfig {
    /// zlib level (-1..=9) for outgoing payloads; incoming payloads are
    /// decompressed when they carry the marker.
    pub compression: Option<i32>,
    pub short_circuit: Option<ShortCircuitConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    /// Second file-system root that receives sends the primary rejects.
    pub failover_root: Option<PathBuf>,
    /// Park large payloads on disk and send a reference instead.
    pub message_store: Option<MessageStoreConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageStoreConfig {
    pub root: PathBuf,
    /// Payloads up to this many bytes are sent inline. Unset stores all.
    pub threshold_bytes: Option<usize>,
    /// Remove the stored payload once the reference is committed.
    pub delete_on_commit: bool,
}

impl Default for MessageStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            threshold_bytes: None,
            delete_on_commit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortCircuitConfig {
    pub fail_count: u32,
    pub cooldown_ms: u64,
}

impl Default for ShortCircuitConfig {
    fn default() -> Self {
        Self {
            fail_count: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl ShortCircuitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub actions: usize,
    pub per_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            actions: 100,
            per_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn per(&self) -> Duration {
        Duration::from_millis(self.per_ms)
    }
}
