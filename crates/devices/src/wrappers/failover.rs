//! Output wrapper that falls back to a second device when the first fails.

use std::sync::Arc;

use {async_trait::async_trait, tracing::warn};

#[cfg(feature = "metrics")]
use flowline_metrics::{counter, devices as dev_metrics, labels};

use crate::{
    device::OutputDevice,
    error::{Error, Result},
    manager::OutputDeviceManager,
    message::MessageBundle,
};

/// Sends to `primary`; on any failure sends the same bundle to `failover`.
///
/// Only fails when both devices fail, with both errors attached.
pub struct FailoverOutputDevice {
    name: String,
    primary: Arc<dyn OutputDevice>,
    failover: Arc<dyn OutputDevice>,
}

impl FailoverOutputDevice {
    pub fn new(
        name: impl Into<String>,
        primary: Arc<dyn OutputDevice>,
        failover: Arc<dyn OutputDevice>,
    ) -> Self {
        Self {
            name: name.into(),
            primary,
            failover,
        }
    }
}

#[async_trait]
impl OutputDevice for FailoverOutputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, bundle: &MessageBundle) -> Result<()> {
        let primary_err = match self.primary.send_message(bundle).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(
            device = %self.name,
            primary = self.primary.name(),
            failover = self.failover.name(),
            error = %primary_err,
            "primary send failed, trying failover"
        );
        #[cfg(feature = "metrics")]
        counter!(dev_metrics::FAILOVER_SENDS_TOTAL, labels::DEVICE => self.name.clone())
            .increment(1);

        match self.failover.send_message(bundle).await {
            Ok(()) => Ok(()),
            Err(failover_err) => Err(Error::aggregated(
                format!("send to '{}' failed on primary and failover", self.name),
                vec![primary_err, failover_err],
            )),
        }
    }

    async fn close(&self) -> Result<()> {
        let primary = self.primary.close().await;
        let failover = self.failover.close().await;
        primary.and(failover)
    }
}

/// Wraps every device of `inner` with a failover device of the same name from
/// `failover`.
pub struct FailoverOutputDeviceManager {
    inner: Arc<dyn OutputDeviceManager>,
    failover: Arc<dyn OutputDeviceManager>,
}

impl FailoverOutputDeviceManager {
    pub fn new(inner: Arc<dyn OutputDeviceManager>, failover: Arc<dyn OutputDeviceManager>) -> Self {
        Self { inner, failover }
    }
}

#[async_trait]
impl OutputDeviceManager for FailoverOutputDeviceManager {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await?;
        self.failover.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        let inner = self.inner.disconnect().await;
        let failover = self.failover.disconnect().await;
        inner.and(failover)
    }

    async fn create_output_device(&self, name: &str) -> Result<Arc<dyn OutputDevice>> {
        let primary = self.inner.create_output_device(name).await?;
        let failover = self.failover.create_output_device(name).await?;
        Ok(Arc::new(FailoverOutputDevice::new(name, primary, failover)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use {super::*, crate::message::Message};

    /// Records the order in which devices were called into a shared log.
    struct Recording {
        name: String,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OutputDevice for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send_message(&self, _bundle: &MessageBundle) -> Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                Err(Error::transport(&self.name, "refused"))
            } else {
                Ok(())
            }
        }
    }

    fn device(name: &str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn OutputDevice> {
        Arc::new(Recording {
            name: name.into(),
            fail,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn failing_primary_is_tried_first_then_failover_succeeds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dev = FailoverOutputDevice::new(
            "out",
            device("primary", true, &log),
            device("backup", false, &log),
        );
        for _ in 0..3 {
            dev.send_message(&MessageBundle::new(Message::new("x")))
                .await
                .unwrap();
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["primary", "backup", "primary", "backup", "primary", "backup"]
        );
    }

    #[tokio::test]
    async fn healthy_primary_skips_failover() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dev = FailoverOutputDevice::new(
            "out",
            device("primary", false, &log),
            device("backup", false, &log),
        );
        dev.send_message(&MessageBundle::default()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["primary"]);
    }

    #[tokio::test]
    async fn both_failing_reports_both_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dev = FailoverOutputDevice::new(
            "out",
            device("primary", true, &log),
            device("backup", true, &log),
        );
        let err = dev.send_message(&MessageBundle::default()).await.unwrap_err();
        match err {
            Error::Aggregated { failures, .. } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
