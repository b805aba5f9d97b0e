//! Stops a pipeline service that keeps failing or stops making progress.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    flowline_common::{ServiceState, SubscriptionId},
    tokio::{task::JoinHandle, time::Instant},
    tracing::error,
};

use crate::service::{LoopMetrics, PipelineService, ServiceHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopHealthMonitor {
    /// Stop after this many failed passes in a row.
    pub max_consecutive_failures: Option<u32>,
    /// Stop when no pass has finished for this long (a stuck handler).
    pub max_inactivity: Option<Duration>,
}

/// Keeps the monitor attached. Dropping it detaches the monitor.
pub struct HealthGuard {
    service_events: flowline_common::Observable<LoopMetrics>,
    subscription: Option<SubscriptionId>,
    watchdog: Option<JoinHandle<()>>,
}

impl Drop for HealthGuard {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.service_events.unsubscribe(id);
        }
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
    }
}

impl LoopHealthMonitor {
    pub fn is_enabled(&self) -> bool {
        self.max_consecutive_failures.is_some() || self.max_inactivity.is_some()
    }

    /// Attach to `service`. Must be called from within a tokio runtime when
    /// `max_inactivity` is set.
    pub fn attach(&self, service: &PipelineService) -> HealthGuard {
        let handle = service.handle();
        let last_pass = Arc::new(Mutex::new(Instant::now()));
        let events = service.loop_events().clone();

        let subscription = {
            let handle = handle.clone();
            let last_pass = Arc::clone(&last_pass);
            let failures = Arc::new(AtomicU32::new(0));
            let limit = self.max_consecutive_failures;
            events.subscribe(move |m: &LoopMetrics| {
                *last_pass.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                if !m.is_failure() {
                    failures.store(0, Ordering::Relaxed);
                    return;
                }
                let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(max) = limit
                    && count >= max
                    && !handle.is_stop_requested()
                {
                    error!(failures = count, "too many consecutive loop failures, stopping service");
                    handle.stop();
                }
            })
        };

        let watchdog = self
            .max_inactivity
            .map(|max| tokio::spawn(watch_inactivity(handle, last_pass, max)));

        HealthGuard {
            service_events: events,
            subscription: Some(subscription),
            watchdog,
        }
    }
}

async fn watch_inactivity(
    mut handle: ServiceHandle,
    last_pass: Arc<Mutex<Instant>>,
    max: Duration,
) {
    handle.wait_for(ServiceState::Running).await;
    // reset the clock once the loop actually starts
    *last_pass.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    let check_every = (max / 4).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(check_every).await;
        if handle.state() != ServiceState::Running || handle.is_stop_requested() {
            return;
        }
        let idle = last_pass.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
        if idle > max {
            error!(?idle, "no loop progress within the inactivity limit, stopping service");
            handle.stop();
            return;
        }
    }
}
