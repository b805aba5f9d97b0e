//! Reading several messages per poll without changing the commit contract:
//! each read still carries its own transaction.

use std::time::Duration;

use {tokio::time::Instant, tracing::warn};

use crate::{device::InputDevice, error::Result, transaction::ReadResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReader {
    max_count: usize,
    wait_for_full_batch: bool,
}

impl Default for BatchReader {
    fn default() -> Self {
        Self::single()
    }
}

impl BatchReader {
    /// `max_count` below one is treated as one.
    ///
    /// With `wait_for_full_batch` the reader keeps waiting (up to the
    /// timeout) for the batch to fill; otherwise it takes the first message
    /// plus whatever else is immediately available.
    pub fn new(max_count: usize, wait_for_full_batch: bool) -> Self {
        Self {
            max_count: max_count.max(1),
            wait_for_full_batch,
        }
    }

    pub fn single() -> Self {
        Self::new(1, false)
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Read up to `max_count` messages from `device`.
    ///
    /// The first read waits the full `timeout`. If a later read fails, the
    /// messages already taken are rolled back before the error is returned.
    pub async fn read_batch(
        &self,
        device: &dyn InputDevice,
        timeout: Duration,
    ) -> Result<Vec<ReadResult>> {
        let deadline = Instant::now() + timeout;
        let Some(first) = device.read_message(timeout).await? else {
            return Ok(Vec::new());
        };
        let mut batch = Vec::with_capacity(self.max_count);
        batch.push(first);

        while batch.len() < self.max_count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = if self.wait_for_full_batch {
                if remaining.is_zero() {
                    break;
                }
                remaining
            } else {
                Duration::ZERO
            };
            match device.read_message(wait).await {
                Ok(Some(result)) => batch.push(result),
                Ok(None) => break,
                Err(e) => {
                    for taken in batch {
                        if let Err(rb) = taken.rollback().await {
                            warn!(device = device.name(), error = %rb, "rollback of partial batch failed");
                        }
                    }
                    return Err(e);
                },
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use {
        super::*,
        crate::{
            manager::InputDeviceManager, message::Message,
            transports::memory::InMemoryDeviceManager,
        },
        rstest::rstest,
    };

    async fn queue_with(n: usize) -> (Arc<InMemoryDeviceManager>, Arc<dyn InputDevice>) {
        let memory = Arc::new(InMemoryDeviceManager::new());
        for i in 0..n {
            memory.push("q", Message::new(format!("m{i}")));
        }
        let dev = memory.create_input_device("q").await.unwrap();
        (memory, dev)
    }

    #[rstest]
    #[case(1, 5, 1)]
    #[case(3, 5, 3)]
    #[case(10, 4, 4)]
    #[case(4, 0, 0)]
    #[tokio::test]
    async fn reads_up_to_max_count(
        #[case] max: usize,
        #[case] available: usize,
        #[case] expected: usize,
    ) {
        let (memory, dev) = queue_with(available).await;
        let batch = BatchReader::new(max, false)
            .read_batch(dev.as_ref(), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(batch.len(), expected);
        for r in batch {
            r.commit().await.unwrap();
        }
        assert_eq!(memory.len("q"), available - expected);
    }

    #[tokio::test]
    async fn preserves_queue_order() {
        let (_memory, dev) = queue_with(3).await;
        let batch = BatchReader::new(3, false)
            .read_batch(dev.as_ref(), Duration::ZERO)
            .await
            .unwrap();
        let bodies: Vec<Vec<u8>> = batch
            .iter()
            .map(|r| r.bundle().message.bytes().to_vec())
            .collect();
        assert_eq!(bodies, vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec()]);
        for r in batch {
            r.commit().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_late_messages_when_asked() {
        let (memory, dev) = queue_with(1).await;
        let producer = Arc::clone(&memory);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push("q", Message::new("late"));
        });
        let batch = BatchReader::new(2, true)
            .read_batch(dev.as_ref(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        for r in batch {
            r.commit().await.unwrap();
        }
    }

    #[test]
    fn zero_max_count_means_one() {
        assert_eq!(BatchReader::new(0, true).max_count(), 1);
    }
}
