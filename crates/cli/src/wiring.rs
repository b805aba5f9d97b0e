//! Turns a [`FlowlineConfig`] into device managers and a pipeline service.

use std::{sync::Arc, time::Duration};

use {
    anyhow::Context,
    async_trait::async_trait,
    flowline_common::{Service, ServiceState},
    flowline_config::{FileSystemTransportConfig, FlowlineConfig, TransportConfig, WrappersConfig},
    flowline_devices::{
        DeviceManager, InputDeviceManager, OutputDeviceManager,
        transports::{FileSystemDeviceManager, FileSystemOptions, InMemoryDeviceManager},
        wrappers::{
            FailoverOutputDeviceManager, FileSystemMessageStore, MessageStore,
            MessageStoreInputDeviceManager, MessageStoreOutputDeviceManager,
            RateLimitedInputDeviceManager, RateLimitedOutputDeviceManager, RateLimiter,
            ShortCircuitInputDeviceManager, ShortCircuitOutputDeviceManager, ShortCircuitPolicy,
            TransformerInputDeviceManager, TransformerOutputDeviceManager, ZlibTransformer,
        },
    },
    flowline_pipeline::{
        FixedRouterPipelineHandler, LoopHealthMonitor, PipelineService, PipelineServiceConfig,
    },
    flowline_runner::{ProcessRunnerConfig, ServiceFactory},
};

/// Input and output managers for one process.
pub struct Managers {
    pub input: Arc<dyn InputDeviceManager>,
    pub output: Arc<dyn OutputDeviceManager>,
}

pub fn file_system_options(config: &FileSystemTransportConfig) -> FileSystemOptions {
    FileSystemOptions {
        max_rollbacks: config.max_rollbacks,
        fifo: config.fifo,
        poll_interval: Duration::from_millis(config.poll_interval_ms),
    }
}

/// The bare transport, without wrappers.
pub fn build_transport(transport: &TransportConfig) -> Managers {
    match transport {
        TransportConfig::Memory => {
            let queues = Arc::new(InMemoryDeviceManager::new());
            let input: Arc<dyn InputDeviceManager> = queues.clone();
            Managers {
                input,
                output: queues,
            }
        },
        TransportConfig::FileSystem(fs) => {
            let manager = Arc::new(FileSystemDeviceManager::new(
                fs.root.clone(),
                file_system_options(fs),
            ));
            let input: Arc<dyn InputDeviceManager> = manager.clone();
            Managers {
                input,
                output: manager,
            }
        },
    }
}

/// Wrap `managers` innermost first: message store, compression, short
/// circuit, rate limit, then output failover.
pub fn apply_wrappers(mut managers: Managers, wrappers: &WrappersConfig) -> anyhow::Result<Managers> {
    if let Some(ms) = &wrappers.message_store {
        let store: Arc<dyn MessageStore> = Arc::new(FileSystemMessageStore::new(ms.root.clone()));
        managers.input = Arc::new(MessageStoreInputDeviceManager::new(
            managers.input,
            store.clone(),
            ms.delete_on_commit,
        ));
        managers.output = Arc::new(MessageStoreOutputDeviceManager::new(
            managers.output,
            store,
            ms.threshold_bytes,
        ));
    }

    if let Some(level) = wrappers.compression {
        let zlib = Arc::new(ZlibTransformer::new(level)?);
        managers.input = Arc::new(TransformerInputDeviceManager::new(
            managers.input,
            zlib.clone(),
        ));
        managers.output = Arc::new(TransformerOutputDeviceManager::new(managers.output, zlib));
    }

    if let Some(sc) = &wrappers.short_circuit {
        let policy = ShortCircuitPolicy {
            fail_count: sc.fail_count,
            cooldown: sc.cooldown(),
        };
        managers.input = Arc::new(ShortCircuitInputDeviceManager::new(managers.input, policy));
        managers.output = Arc::new(ShortCircuitOutputDeviceManager::new(managers.output, policy));
    }

    if let Some(rl) = &wrappers.rate_limit {
        // Separate windows: reads and sends are limited independently.
        let reads = Arc::new(RateLimiter::new(rl.actions, rl.per())?);
        let sends = Arc::new(RateLimiter::new(rl.actions, rl.per())?);
        managers.input = Arc::new(RateLimitedInputDeviceManager::new(managers.input, reads));
        managers.output = Arc::new(RateLimitedOutputDeviceManager::new(managers.output, sends));
    }

    if let Some(root) = &wrappers.failover_root {
        let failover = Arc::new(FileSystemDeviceManager::new(
            root.clone(),
            FileSystemOptions::default(),
        ));
        managers.output = Arc::new(FailoverOutputDeviceManager::new(managers.output, failover));
    }

    Ok(managers)
}

pub fn build_managers(config: &FlowlineConfig) -> anyhow::Result<Managers> {
    apply_wrappers(build_transport(&config.transport), &config.wrappers)
}

pub fn service_config(config: &FlowlineConfig, stop_on_signal: bool) -> PipelineServiceConfig {
    let service = &config.service;
    PipelineServiceConfig {
        name: service.name.clone(),
        input_devices: service.input_devices.clone(),
        poll_timeout: service.poll_timeout(),
        idle_backoff: service.idle_backoff(),
        max_batch_read_count: service.max_batch_read_count,
        wait_for_batch_count: service.wait_for_batch_count,
        loop_failure_backoff: service.loop_failure_backoff(),
        stop_on_signal,
    }
}

pub fn runner_config(config: &FlowlineConfig) -> ProcessRunnerConfig {
    let runner = &config.runner;
    ProcessRunnerConfig {
        instances: runner.instances,
        shutdown_timeout: runner.shutdown_timeout(),
        restart_on_failure: runner.restart_on_failure,
        restart_backoff: runner.restart_backoff(),
        live_check_interval: runner.live_check_interval(),
        live_check_timeout: runner.live_check_timeout(),
    }
}

pub fn health_monitor(config: &FlowlineConfig) -> LoopHealthMonitor {
    LoopHealthMonitor {
        max_consecutive_failures: config.service.max_consecutive_failures,
        max_inactivity: config.service.max_inactivity(),
    }
}

// ── Service ─────────────────────────────────────────────────────────────────

/// A pipeline service with its loop health monitor attached while running.
pub struct MonitoredPipeline {
    service: PipelineService,
    monitor: LoopHealthMonitor,
}

impl MonitoredPipeline {
    pub fn new(service: PipelineService, monitor: LoopHealthMonitor) -> Self {
        Self { service, monitor }
    }
}

#[async_trait]
impl Service for MonitoredPipeline {
    fn name(&self) -> &str {
        self.service.config().name.as_str()
    }

    async fn start(&self) -> anyhow::Result<()> {
        let _guard = self
            .monitor
            .is_enabled()
            .then(|| self.monitor.attach(&self.service));
        self.service.run().await?;
        Ok(())
    }

    fn stop(&self) {
        self.service.stop();
    }

    fn state(&self) -> ServiceState {
        self.service.state()
    }
}

/// Builds a fixed-router pipeline from config; used in-process and by each
/// child instance.
pub struct PipelineFactory {
    config: FlowlineConfig,
    stop_on_signal: bool,
}

impl PipelineFactory {
    pub fn new(config: FlowlineConfig, stop_on_signal: bool) -> Self {
        Self {
            config,
            stop_on_signal,
        }
    }
}

impl ServiceFactory for PipelineFactory {
    fn create_service(&self) -> anyhow::Result<Box<dyn Service>> {
        let output = self
            .config
            .service
            .output_device
            .clone()
            .context("service.output_device is required to run")?;
        let managers = build_managers(&self.config)?;
        let devices = DeviceManager::new()
            .with_input_manager(managers.input)
            .with_output_manager(managers.output);
        let service = PipelineService::new(
            service_config(&self.config, self.stop_on_signal),
            Arc::new(FixedRouterPipelineHandler::new(output)),
            devices,
        );
        Ok(Box::new(MonitoredPipeline::new(
            service,
            health_monitor(&self.config),
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        flowline_config::{MessageStoreConfig, RateLimitConfig, ShortCircuitConfig},
        flowline_devices::{Message, MessageBundle},
    };

    fn fs_config(root: &std::path::Path) -> FlowlineConfig {
        let mut config = FlowlineConfig::default();
        config.transport = TransportConfig::FileSystem(FileSystemTransportConfig {
            root: root.to_path_buf(),
            ..Default::default()
        });
        config.service.input_devices = vec!["in".into()];
        config.service.output_device = Some("out".into());
        config.service.poll_timeout_ms = 20;
        config
    }

    #[test]
    fn factory_requires_an_output_device() {
        let mut config = FlowlineConfig::default();
        config.service.input_devices = vec!["in".into()];
        let err = PipelineFactory::new(config, false)
            .create_service()
            .err()
            .unwrap();
        assert!(err.to_string().contains("output_device"));
    }

    #[test]
    fn invalid_compression_level_fails_wiring() {
        let mut config = FlowlineConfig::default();
        config.wrappers.compression = Some(42);
        assert!(build_managers(&config).is_err());
    }

    #[tokio::test]
    async fn wrapped_file_system_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fs_config(dir.path());
        config.wrappers.compression = Some(6);
        config.wrappers.short_circuit = Some(ShortCircuitConfig::default());
        config.wrappers.rate_limit = Some(RateLimitConfig::default());

        let managers = build_managers(&config).unwrap();
        let mut devices = DeviceManager::new()
            .with_input_manager(managers.input)
            .with_output_manager(managers.output);
        devices.connect().await.unwrap();

        let out = devices.get_output_device("q").await.unwrap();
        out.send_message(&MessageBundle::new(Message::new("hello").header("k", "v")))
            .await
            .unwrap();

        let input = devices.get_input_device("q").await.unwrap();
        let read = input
            .read_message(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.bundle().message.bytes(), b"hello");
        read.commit().await.unwrap();
        devices.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn large_payloads_go_through_the_message_store() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        let mut config = fs_config(&dir.path().join("queues"));
        config.wrappers.compression = Some(-1);
        config.wrappers.message_store = Some(MessageStoreConfig {
            root: store_root.clone(),
            threshold_bytes: Some(8),
            ..Default::default()
        });

        let managers = build_managers(&config).unwrap();
        let mut devices = DeviceManager::new()
            .with_input_manager(managers.input)
            .with_output_manager(managers.output);
        devices.connect().await.unwrap();

        let body = vec![b'z'; 4096];
        let out = devices.get_output_device("q").await.unwrap();
        out.send_message(&MessageBundle::new(Message::new(body.clone())))
            .await
            .unwrap();
        let buckets = std::fs::read_dir(&store_root).unwrap().count();
        assert_eq!(buckets, 1);

        let input = devices.get_input_device("q").await.unwrap();
        let read = input
            .read_message(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.bundle().message.bytes(), body.as_slice());
        read.commit().await.unwrap();
        assert_eq!(std::fs::read_dir(&store_root).unwrap().count(), 0);
        devices.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn fixed_router_pipeline_moves_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = fs_config(dir.path());

        let seed = build_transport(&config.transport);
        let mut seeder = DeviceManager::new().with_output_manager(seed.output);
        seeder.connect().await.unwrap();
        seeder
            .get_output_device("in")
            .await
            .unwrap()
            .send_message(&MessageBundle::new(Message::new("payload")))
            .await
            .unwrap();

        let service: Arc<dyn Service> =
            Arc::from(PipelineFactory::new(config, false).create_service().unwrap());
        let runner = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.start().await })
        };

        let out_dir = dir.path().join("out");
        for _ in 0..200 {
            if std::fs::read_dir(&out_dir).map(|d| d.count()).unwrap_or(0) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        service.stop();
        runner.await.unwrap().unwrap();

        let files: Vec<_> = std::fs::read_dir(&out_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[test]
    fn runner_and_monitor_follow_config() {
        let mut config = FlowlineConfig::default();
        config.runner.instances = 3;
        config.service.max_consecutive_failures = Some(4);
        assert_eq!(runner_config(&config).instances, 3);
        let monitor = health_monitor(&config);
        assert_eq!(monitor.max_consecutive_failures, Some(4));
        assert!(monitor.is_enabled());
    }
}
