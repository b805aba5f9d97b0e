//! Tiny synchronous fan-out used for lifecycle and loop events.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use tracing::debug;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Observable::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A list of callbacks notified in subscription order.
///
/// Cloning shares the subscriber list. Callbacks run on the emitting task and
/// should return quickly.
pub struct Observable<T> {
    subscribers: Arc<Mutex<Vec<(SubscriptionId, Callback<T>)>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Observable<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn emit(&self, event: &T) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let snapshot: Vec<Callback<T>> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        debug!(subscribers = snapshot.len(), "emitting event");
        for cb in snapshot {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn emits_to_all_subscribers_in_order() {
        let obs = Observable::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            obs.subscribe(move |v| seen.lock().unwrap().push(format!("{tag}{v}")));
        }
        obs.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec!["a7", "b7"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let obs = Observable::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = obs.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        obs.emit(&());
        assert!(obs.unsubscribe(id));
        assert!(!obs.unsubscribe(id));
        obs.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(obs.is_empty());
    }

    #[test]
    fn clones_share_subscribers() {
        let obs = Observable::<u8>::new();
        let other = obs.clone();
        other.subscribe(|_| {});
        assert_eq!(obs.len(), 1);
    }
}
