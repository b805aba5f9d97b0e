//! Supervises N child processes, each running its own service instance.

use std::{
    process::ExitStatus,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    flowline_common::{Service, ServiceState},
    futures::future::join_all,
    tokio::{
        sync::watch,
        time::{Instant, Interval, MissedTickBehavior, interval_at},
    },
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

#[cfg(feature = "metrics")]
use flowline_metrics::{counter, gauge, labels, runner as runner_metrics};

use crate::{
    error::{Error, Result},
    factory::ServiceFactory,
    process::{ChildCommand, ChildProcess},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRunnerConfig {
    pub instances: usize,
    /// Grace period for each shutdown step (stop command, SIGTERM, kill).
    pub shutdown_timeout: Duration,
    pub restart_on_failure: bool,
    pub restart_backoff: Duration,
    /// How often to check each child. `None` only watches for exits.
    pub live_check_interval: Option<Duration>,
    pub live_check_timeout: Duration,
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self {
            instances: 1,
            shutdown_timeout: Duration::from_secs(5),
            restart_on_failure: true,
            restart_backoff: Duration::from_secs(1),
            live_check_interval: Some(Duration::from_secs(60)),
            live_check_timeout: Duration::from_secs(10),
        }
    }
}

enum SlotEvent {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    LiveCheck,
}

/// Runs `instances` copies of a child command and keeps them running.
///
/// Children share nothing with the parent or each other; each builds its own
/// service and devices. `start` returns once every child is gone.
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
    command: ChildCommand,
    cancel: CancellationToken,
    state: watch::Sender<ServiceState>,
    started: AtomicBool,
}

impl ProcessRunner {
    pub fn new(config: ProcessRunnerConfig, command: ChildCommand) -> Self {
        let (state, _) = watch::channel(ServiceState::Created);
        Self {
            config,
            command,
            cancel: CancellationToken::new(),
            state,
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ProcessRunnerConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(instances = self.config.instances, "stopping all instances");
            self.cancel.cancel();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.config.instances == 0 {
            return Err(Error::invalid_config("instances must be at least 1"));
        }
        if self.config.live_check_interval == Some(Duration::ZERO) {
            return Err(Error::invalid_config("live_check_interval must be positive"));
        }
        Ok(())
    }

    pub async fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted {
                state: self.state().to_string(),
            });
        }
        if let Err(e) = self.validate() {
            self.state.send_replace(ServiceState::Stopped);
            return Err(e);
        }

        self.state.send_replace(ServiceState::Running);
        info!(instances = self.config.instances, program = %self.command.program.display(), "process runner started");

        let supervise = join_all((0..self.config.instances).map(|index| self.supervise(index)));
        tokio::pin!(supervise);
        let outcomes = tokio::select! {
            outcomes = &mut supervise => outcomes,
            () = self.cancel.cancelled() => {
                self.state.send_replace(ServiceState::Stopping);
                supervise.await
            },
        };

        self.state.send_replace(ServiceState::Stopping);
        self.state.send_replace(ServiceState::Stopped);
        let mut failures = outcomes.into_iter().filter_map(|o| o.err());
        match failures.next() {
            Some(first) => {
                error!(error = %first, "process runner finished with failed instances");
                Err(first)
            },
            None => {
                info!("process runner stopped");
                Ok(())
            },
        }
    }

    /// Keep instance `index` alive until stopped. Returns an error when the
    /// child failed and will not be restarted.
    async fn supervise(&self, index: usize) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let mut child = ChildProcess::spawn(&self.command, index, self.config.instances)?;
            #[cfg(feature = "metrics")]
            {
                counter!(runner_metrics::CHILDREN_SPAWNED_TOTAL, labels::INSTANCE => index.to_string()).increment(1);
                gauge!(runner_metrics::CHILDREN_ALIVE).increment(1.0);
            }
            let outcome = self.watch_child(&mut child).await;
            #[cfg(feature = "metrics")]
            gauge!(runner_metrics::CHILDREN_ALIVE).decrement(1.0);

            let status = match outcome {
                ChildOutcome::Stopped => return Ok(()),
                ChildOutcome::Finished => {
                    info!(instance = index, "instance finished on its own");
                    return Ok(());
                },
                ChildOutcome::Failed(status) => status,
            };

            #[cfg(feature = "metrics")]
            counter!(runner_metrics::CHILD_FAILURES_TOTAL, labels::INSTANCE => index.to_string()).increment(1);
            if !self.config.restart_on_failure {
                error!(instance = index, %status, "instance failed");
                return Err(Error::ChildFailed { index, status });
            }
            warn!(instance = index, %status, backoff = ?self.config.restart_backoff, "instance failed, restarting");
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.config.restart_backoff) => {},
            }
        }
    }

    async fn watch_child(&self, child: &mut ChildProcess) -> ChildOutcome {
        let mut live_checks = self
            .config
            .live_check_interval
            .map(|every| {
                let mut interval = interval_at(Instant::now() + every, every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

        loop {
            let event = tokio::select! {
                status = child.wait() => SlotEvent::Exited(status),
                () = self.cancel.cancelled() => SlotEvent::Cancelled,
                () = next_tick(&mut live_checks) => SlotEvent::LiveCheck,
            };
            match event {
                SlotEvent::Exited(Ok(status)) if status.success() => return ChildOutcome::Finished,
                SlotEvent::Exited(Ok(status)) => return ChildOutcome::Failed(status.to_string()),
                SlotEvent::Exited(Err(e)) => return ChildOutcome::Failed(format!("wait failed: {e}")),
                SlotEvent::Cancelled => {
                    child.stop(self.config.shutdown_timeout).await;
                    return ChildOutcome::Stopped;
                },
                SlotEvent::LiveCheck => {
                    let alive = tokio::select! {
                        alive = child.check_alive(self.config.live_check_timeout) => Some(alive),
                        () = self.cancel.cancelled() => None,
                    };
                    match alive {
                        Some(true) => continue,
                        Some(false) if !self.cancel.is_cancelled() => {},
                        Some(false) | None => {
                            child.stop(self.config.shutdown_timeout).await;
                            return ChildOutcome::Stopped;
                        },
                    }
                    warn!(instance = child.index(), "instance failed liveness check");
                    #[cfg(feature = "metrics")]
                    counter!(runner_metrics::LIVE_CHECK_FAILURES_TOTAL, labels::INSTANCE => child.index().to_string()).increment(1);
                    child.stop(self.config.shutdown_timeout).await;
                    return ChildOutcome::Failed("liveness check failed".into());
                },
            }
        }
    }
}

enum ChildOutcome {
    /// Stopped by the runner.
    Stopped,
    /// Exited successfully without being asked to.
    Finished,
    Failed(String),
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        },
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Service for ProcessRunner {
    fn name(&self) -> &str {
        "process-runner"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.run().await.map_err(anyhow::Error::from)
    }

    fn stop(&self) {
        ProcessRunner::stop(self);
    }

    fn state(&self) -> ServiceState {
        ProcessRunner::state(self)
    }
}

/// The service to run in this process: the factory's own service for a
/// single instance, otherwise a [`ProcessRunner`] over `command`.
pub fn get_service_runner(
    factory: &dyn ServiceFactory,
    config: ProcessRunnerConfig,
    command: ChildCommand,
) -> anyhow::Result<Arc<dyn Service>> {
    if config.instances <= 1 {
        return Ok(Arc::from(factory.create_service()?));
    }
    Ok(Arc::new(ProcessRunner::new(config, command)))
}
