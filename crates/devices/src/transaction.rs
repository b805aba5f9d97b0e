//! Read completion: every message read from an input device must be either
//! committed or rolled back, exactly once.
//!
//! Completion methods take `self` by value, so finishing a transaction twice
//! does not compile. Forgetting to finish one is reported loudly when the
//! value is dropped.

use {async_trait::async_trait, tracing::error};

use crate::{
    error::{Context, Error, Result},
    message::MessageBundle,
};

/// The transport-side half of a read: how to acknowledge or return the message.
#[async_trait]
pub trait InputTransaction: Send {
    /// Acknowledge the message. It will not be redelivered.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Return the message to the transport. Redelivery is up to the transport.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Transaction for transports that acknowledge on read.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransaction;

#[async_trait]
impl InputTransaction for NullTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A read message plus the obligation to resolve it.
pub struct ReadResult {
    bundle: MessageBundle,
    transaction: Option<Box<dyn InputTransaction>>,
}

impl std::fmt::Debug for ReadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadResult")
            .field("bundle", &self.bundle)
            .field("pending", &self.transaction.is_some())
            .finish()
    }
}

impl ReadResult {
    pub fn new(bundle: MessageBundle, transaction: impl InputTransaction + 'static) -> Self {
        Self {
            bundle,
            transaction: Some(Box::new(transaction)),
        }
    }

    /// A result whose message the transport already acknowledged.
    pub fn auto_committed(bundle: MessageBundle) -> Self {
        Self::new(bundle, NullTransaction)
    }

    /// Rebuild a result around an existing transaction. Wrappers use this to
    /// hand back a transformed bundle tied to the inner device's transaction.
    pub fn from_parts(bundle: MessageBundle, transaction: Box<dyn InputTransaction>) -> Self {
        Self {
            bundle,
            transaction: Some(transaction),
        }
    }

    pub fn bundle(&self) -> &MessageBundle {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut MessageBundle {
        &mut self.bundle
    }

    /// Split into the bundle and the still-pending transaction.
    pub fn into_parts(mut self) -> (MessageBundle, Box<dyn InputTransaction>) {
        let bundle = std::mem::take(&mut self.bundle);
        let transaction = self
            .transaction
            .take()
            .unwrap_or_else(|| Box::new(NullTransaction));
        (bundle, transaction)
    }

    /// Replace the bundle, keeping the same transaction.
    #[must_use]
    pub fn map_bundle(self, f: impl FnOnce(MessageBundle) -> MessageBundle) -> Self {
        let (bundle, transaction) = self.into_parts();
        Self::from_parts(f(bundle), transaction)
    }

    pub async fn commit(mut self) -> Result<()> {
        let tx = self
            .transaction
            .take()
            .context("read result already resolved")?;
        tx.commit().await
    }

    pub async fn rollback(mut self) -> Result<()> {
        let tx = self
            .transaction
            .take()
            .context("read result already resolved")?;
        tx.rollback().await
    }
}

impl Drop for ReadResult {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            error!(
                headers = ?self.bundle.device_headers,
                "read result dropped without commit or rollback"
            );
        }
    }
}

/// Groups several reads so they are committed or rolled back together.
///
/// Each inner transaction is still finished exactly once. A failure while
/// committing one entry does not stop the others; the errors are returned
/// together.
#[derive(Default)]
pub struct TransactionScope {
    pending: Vec<Box<dyn InputTransaction>>,
}

impl TransactionScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a read's transaction and return its bundle.
    pub fn adopt(&mut self, result: ReadResult) -> MessageBundle {
        let (bundle, tx) = result.into_parts();
        self.pending.push(tx);
        bundle
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub async fn commit(mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        finish_all(pending, true).await
    }

    pub async fn rollback(mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        finish_all(pending, false).await
    }
}

async fn finish_all(pending: Vec<Box<dyn InputTransaction>>, commit: bool) -> Result<()> {
    let mut failures = Vec::new();
    for tx in pending {
        let res = if commit {
            tx.commit().await
        } else {
            tx.rollback().await
        };
        if let Err(e) = res {
            failures.push(e);
        }
    }
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => Err(Error::aggregated(
            if commit {
                "batch commit failed"
            } else {
                "batch rollback failed"
            },
            failures,
        )),
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            error!(
                pending = self.pending.len(),
                "transaction scope dropped without commit or rollback"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use {super::*, crate::message::Message};

    #[derive(Clone, Default)]
    struct Counts {
        commits: Arc<AtomicUsize>,
        rollbacks: Arc<AtomicUsize>,
    }

    struct CountingTx(Counts, bool);

    #[async_trait]
    impl InputTransaction for CountingTx {
        async fn commit(self: Box<Self>) -> Result<()> {
            self.0.commits.fetch_add(1, Ordering::SeqCst);
            if self.1 {
                Err(Error::transport("t", "commit lost"))
            } else {
                Ok(())
            }
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            self.0.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn bundle(body: &'static str) -> MessageBundle {
        MessageBundle::new(Message::new(body))
    }

    #[tokio::test]
    async fn map_bundle_keeps_the_same_transaction() {
        let counts = Counts::default();
        let result = ReadResult::new(bundle("a"), CountingTx(counts.clone(), false));
        let mapped = result.map_bundle(|b| MessageBundle::new(b.message.with_data("b")));
        assert_eq!(mapped.bundle().message.bytes(), b"b");
        mapped.commit().await.unwrap();
        assert_eq!(counts.commits.load(Ordering::SeqCst), 1);
        assert_eq!(counts.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scope_commits_every_member_once_and_collects_errors() {
        let counts = Counts::default();
        let mut scope = TransactionScope::new();
        scope.adopt(ReadResult::new(bundle("1"), CountingTx(counts.clone(), true)));
        scope.adopt(ReadResult::new(bundle("2"), CountingTx(counts.clone(), false)));
        scope.adopt(ReadResult::new(bundle("3"), CountingTx(counts.clone(), true)));
        assert_eq!(scope.len(), 3);

        let err = scope.commit().await.unwrap_err();
        assert!(matches!(err, Error::Aggregated { ref failures, .. } if failures.len() == 2));
        assert_eq!(counts.commits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn scope_rollback_reaches_every_member() {
        let counts = Counts::default();
        let mut scope = TransactionScope::new();
        for body in ["x", "y"] {
            scope.adopt(ReadResult::new(bundle(body), CountingTx(counts.clone(), false)));
        }
        scope.rollback().await.unwrap();
        assert_eq!(counts.rollbacks.load(Ordering::SeqCst), 2);
        assert_eq!(counts.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_committed_results_resolve_cleanly() {
        ReadResult::auto_committed(bundle("z")).rollback().await.unwrap();
    }
}
