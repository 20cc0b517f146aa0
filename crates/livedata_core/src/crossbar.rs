//! Invalidation crossbar.
//!
//! The crossbar routes "something under this key changed" notifications
//! from writers to the live queries that may need to re-poll, without a
//! writer knowing which queries exist.
//!
//! Delivery is synchronous with respect to the caller: [`InvalidationCrossbar::fire`]
//! returns only after every listener registered for the key has
//! acknowledged through its [`Completion`]. Listeners acknowledge
//! explicitly because they may need to do work first (for example,
//! register a write on the ambient fence).
//!
//! Listeners are snapshotted when a notification is fired:
//! - A listener stopped *during* delivery still completes that delivery.
//! - A listener added *during* delivery is not called until the next fire.
//!
//! The registry lock is never held while a listener runs, so listeners may
//! register or stop listeners from inside their callback.

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Routing tag connecting writes to interested live queries.
///
/// Keys are compared structurally: two keys built from the same fields and
/// values are the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvalidationKey(BTreeMap<String, String>);

impl InvalidationKey {
    /// Creates an empty key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The key every write to `collection` fires.
    pub fn collection(name: impl Into<String>) -> Self {
        Self::new().with("collection", name)
    }

    /// Adds (or replaces) a field.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Returns a field's value.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }
}

impl fmt::Display for InvalidationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}: {value}")?;
        }
        f.write_str("}")
    }
}

/// A fired notification, as seen by listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// The key the notification was fired on.
    pub key: InvalidationKey,
    /// Free-form payload supplied by the firer.
    pub payload: Value,
}

/// Acknowledgement handle passed to every listener invocation.
///
/// `fire` does not return until every completion handed out for that
/// notification has been completed or dropped.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<()>,
}

impl Completion {
    /// Signals that the listener has finished handling the notification.
    pub fn complete(self) {
        // The firer may have been cancelled; nothing left to signal.
        let _ = self.tx.send(());
    }
}

/// Identifier of a registered listener.
pub type ListenerId = u64;

/// Closure type for crossbar listeners.
pub type ListenerFn = dyn Fn(&Notification, Completion) + Send + Sync;

#[derive(Default)]
struct CrossbarInner {
    listeners: Mutex<HashMap<InvalidationKey, Vec<(ListenerId, Arc<ListenerFn>)>>>,
    next_id: AtomicU64,
}

impl CrossbarInner {
    fn deregister(&self, key: &InvalidationKey, id: ListenerId) {
        let mut listeners = self.listeners.lock();
        if let Some(entries) = listeners.get_mut(key) {
            entries.retain(|(lid, _)| *lid != id);
            if entries.is_empty() {
                listeners.remove(key);
            }
        }
    }
}

/// Process-wide invalidation registry.
///
/// Cheap to clone; clones share the same listener table. Construct one per
/// process (or per test) and hand it to every connection that should see
/// the same invalidations.
#[derive(Clone, Default)]
pub struct InvalidationCrossbar {
    inner: Arc<CrossbarInner>,
}

impl InvalidationCrossbar {
    /// Creates an empty crossbar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for notifications fired on `key`.
    ///
    /// The returned handle deregisters the listener when stopped or dropped.
    pub fn listen<F>(&self, key: InvalidationKey, callback: F) -> ListenerHandle
    where
        F: Fn(&Notification, Completion) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(listener = id, key = %key, "crossbar listener registered");
        ListenerHandle {
            crossbar: Some(Arc::downgrade(&self.inner)),
            key,
            id,
        }
    }

    /// Fires `key`, suspending until every matching listener has completed.
    ///
    /// Returns the number of listeners notified.
    pub async fn fire(&self, key: &InvalidationKey, payload: Value) -> usize {
        let callbacks: Vec<Arc<ListenerFn>> = self
            .inner
            .listeners
            .lock()
            .get(key)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            return 0;
        }

        let notification = Notification {
            key: key.clone(),
            payload,
        };
        let mut pending = Vec::with_capacity(callbacks.len());
        for callback in &callbacks {
            let (tx, rx) = oneshot::channel();
            callback(&notification, Completion { tx });
            pending.push(rx);
        }

        for result in join_all(pending).await {
            if result.is_err() {
                warn!(key = %key, "crossbar listener dropped its completion without completing");
            }
        }
        callbacks.len()
    }

    /// Returns the number of listeners registered for `key`.
    pub fn listener_count(&self, key: &InvalidationKey) -> usize {
        self.inner
            .listeners
            .lock()
            .get(key)
            .map_or(0, |entries| entries.len())
    }
}

impl fmt::Debug for InvalidationCrossbar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationCrossbar")
            .field("keys", &self.inner.listeners.lock().len())
            .finish()
    }
}

/// Registration handle returned by [`InvalidationCrossbar::listen`].
///
/// Holds only a weak reference to the crossbar.
#[derive(Debug)]
pub struct ListenerHandle {
    crossbar: Option<Weak<CrossbarInner>>,
    key: InvalidationKey,
    id: ListenerId,
}

impl ListenerHandle {
    /// Deregisters the listener.
    ///
    /// After this returns the listener receives no further notifications;
    /// a delivery already in flight still completes.
    pub fn stop(mut self) {
        self.deregister();
    }

    fn deregister(&mut self) {
        if let Some(inner) = self.crossbar.take().and_then(|weak| weak.upgrade()) {
            inner.deregister(&self.key, self.id);
            debug!(listener = self.id, key = %self.key, "crossbar listener stopped");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn keys_compare_structurally() {
        let a = InvalidationKey::collection("ledger").with("world", "w1");
        let b = InvalidationKey::new().with("world", "w1").with("collection", "ledger");
        assert_eq!(a, b);
        assert_ne!(a, InvalidationKey::collection("ledger"));
        assert_eq!(a.to_string(), "{collection: ledger, world: w1}");
        assert_eq!(a.get("world"), Some("w1"));
    }

    #[tokio::test]
    async fn fire_reaches_exact_key_only() {
        let crossbar = InvalidationCrossbar::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let _handle = crossbar.listen(InvalidationKey::collection("a"), move |_, done| {
            counter.fetch_add(1, Ordering::SeqCst);
            done.complete();
        });

        assert_eq!(crossbar.fire(&InvalidationKey::collection("a"), json!(null)).await, 1);
        assert_eq!(crossbar.fire(&InvalidationKey::collection("b"), json!(null)).await, 0);
        let wider = InvalidationKey::collection("a").with("world", "w");
        assert_eq!(crossbar.fire(&wider, json!(null)).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fire_waits_for_deferred_completion() {
        let crossbar = InvalidationCrossbar::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&finished);
        let _handle = crossbar.listen(InvalidationKey::collection("a"), move |_, done| {
            let flag = Arc::clone(&flag);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(1, Ordering::SeqCst);
                done.complete();
            });
        });

        crossbar
            .fire(&InvalidationKey::collection("a"), json!({"op": "insert"}))
            .await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_completion_does_not_hang() {
        let crossbar = InvalidationCrossbar::new();
        let _handle = crossbar.listen(InvalidationKey::collection("a"), |_, done| drop(done));
        assert_eq!(crossbar.fire(&InvalidationKey::collection("a"), json!(null)).await, 1);
    }

    #[tokio::test]
    async fn stop_deregisters() {
        let crossbar = InvalidationCrossbar::new();
        let key = InvalidationKey::collection("a");
        let handle = crossbar.listen(key.clone(), |_, done| done.complete());
        let dropped = crossbar.listen(key.clone(), |_, done| done.complete());
        assert_eq!(crossbar.listener_count(&key), 2);

        handle.stop();
        drop(dropped);
        assert_eq!(crossbar.listener_count(&key), 0);
        assert_eq!(crossbar.fire(&key, json!(null)).await, 0);
    }

    #[tokio::test]
    async fn in_flight_delivery_survives_stop() {
        let crossbar = InvalidationCrossbar::new();
        let key = InvalidationKey::collection("a");
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));
        let delivered = Arc::new(AtomicUsize::new(0));

        // The first listener stops the second one during delivery.
        let victim = Arc::clone(&slot);
        let _stopper = crossbar.listen(key.clone(), move |_, done| {
            if let Some(handle) = victim.lock().take() {
                handle.stop();
            }
            done.complete();
        });
        let counter = Arc::clone(&delivered);
        *slot.lock() = Some(crossbar.listen(key.clone(), move |_, done| {
            counter.fetch_add(1, Ordering::SeqCst);
            done.complete();
        }));

        assert_eq!(crossbar.fire(&key, json!(null)).await, 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        // Gone for the next notification.
        assert_eq!(crossbar.fire(&key, json!(null)).await, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
