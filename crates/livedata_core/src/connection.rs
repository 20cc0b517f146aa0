//! Connection: the data-source adapter every other component goes through.
//!
//! A [`Connection`] wraps an asynchronous [`DataStore`] and gives callers a
//! straight-line API: each call suspends the calling task until the store
//! has answered, then returns the result or the store's error.
//!
//! Writes are tied into the rest of the system here:
//! 1. A write token is begun on the ambient [`WriteFence`] (if any)
//! 2. The store performs the write
//! 3. The collection's [`InvalidationKey`] is fired on the crossbar
//! 4. The token is committed
//!
//! A connection may be created before its store is reachable
//! ([`Connection::connect`]). Operations issued in the meantime are queued
//! in submission order and replayed one after another once the store is
//! available.

use crate::config::Config;
use crate::crossbar::{InvalidationCrossbar, InvalidationKey};
use crate::cursor::{Cursor, CursorDescription};
use crate::error::LiveResult;
use crate::fence::{WriteFence, WriteToken};
use futures::future::BoxFuture;
use livedata_store::{
    is_truthy, new_document_id, DataStore, Document, FindOptions, Modifier, Selector,
    StoreError, StoreResult, UpdateOptions, ID_FIELD,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Collection whose writes fail on demand.
///
/// An insert whose document, or an update/remove whose selector, has a
/// truthy `fail` field is rejected with [`StoreError::InjectedFailure`]
/// before the store is touched.
pub const FAILURE_TEST_COLLECTION: &str = "__livedata_failure_test";

type SharedStore = Arc<dyn DataStore>;
type QueuedOp = Box<dyn FnOnce(StoreResult<SharedStore>) -> BoxFuture<'static, ()> + Send>;

enum GateState {
    /// Store not available yet; operations wait here in submission order.
    Pending(VecDeque<QueuedOp>),
    Ready(SharedStore),
    Failed(StoreError),
}

/// Orders operations against a store that may not be connected yet.
struct StoreGate {
    state: Mutex<GateState>,
}

impl StoreGate {
    fn ready(store: SharedStore) -> Self {
        Self {
            state: Mutex::new(GateState::Ready(store)),
        }
    }

    fn pending() -> Self {
        Self {
            state: Mutex::new(GateState::Pending(VecDeque::new())),
        }
    }

    async fn run<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(SharedStore) -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let job: QueuedOp = Box::new(move |store| {
            Box::pin(async move {
                let result = match store {
                    Ok(store) => op(store).await,
                    Err(err) => Err(err),
                };
                let _ = tx.send(result);
            })
        });

        let runnable = {
            let mut state = self.state.lock();
            match &mut *state {
                GateState::Pending(queue) => {
                    queue.push_back(job);
                    None
                }
                GateState::Ready(store) => Some((job, Ok(Arc::clone(store)))),
                GateState::Failed(err) => Some((job, Err(err.clone()))),
            }
        };
        if let Some((job, store)) = runnable {
            job(store).await;
        }

        rx.await
            .unwrap_or_else(|_| Err(StoreError::ConnectionFailed("operation abandoned".into())))
    }

    /// Replays queued operations against `store`, then opens the gate.
    ///
    /// Operations queued while replaying run after the ones already queued.
    async fn open(&self, store: StoreResult<SharedStore>) {
        let mut replayed = 0usize;
        loop {
            let batch = {
                let mut state = self.state.lock();
                let GateState::Pending(queue) = &mut *state else {
                    return;
                };
                if queue.is_empty() {
                    *state = match &store {
                        Ok(store) => GateState::Ready(Arc::clone(store)),
                        Err(err) => GateState::Failed(err.clone()),
                    };
                    break;
                }
                std::mem::take(queue)
            };
            for job in batch {
                job(store.clone()).await;
                replayed += 1;
            }
        }
        debug!(replayed, ok = store.is_ok(), "store gate opened");
    }
}

struct ConnectionInner {
    gate: StoreGate,
    crossbar: InvalidationCrossbar,
    config: Config,
    next_observer_id: AtomicU64,
}

/// Straight-line access to a data store, wired to the crossbar and fences.
///
/// Cheap to clone; clones share the store, crossbar and configuration.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates a connection to an available store with its own crossbar.
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self::open(store, InvalidationCrossbar::new(), Config::default())
    }

    /// Like [`Connection::new`], with a custom configuration.
    pub fn with_config(store: Arc<dyn DataStore>, config: Config) -> Self {
        Self::open(store, InvalidationCrossbar::new(), config)
    }

    /// Creates a connection to an available store.
    pub fn open(store: Arc<dyn DataStore>, crossbar: InvalidationCrossbar, config: Config) -> Self {
        Self::from_gate(StoreGate::ready(store), crossbar, config)
    }

    /// Creates a connection whose store becomes available when `connecting`
    /// resolves.
    ///
    /// Returns immediately. Must be called from within a tokio runtime.
    pub fn connect<F>(connecting: F, crossbar: InvalidationCrossbar, config: Config) -> Self
    where
        F: Future<Output = StoreResult<Arc<dyn DataStore>>> + Send + 'static,
    {
        let conn = Self::from_gate(StoreGate::pending(), crossbar, config);
        let inner = Arc::clone(&conn.inner);
        tokio::spawn(async move {
            let store = connecting.await;
            if let Err(err) = &store {
                warn!(error = %err, "store connection failed");
            }
            inner.gate.open(store).await;
        });
        conn
    }

    fn from_gate(gate: StoreGate, crossbar: InvalidationCrossbar, config: Config) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                gate,
                crossbar,
                config,
                next_observer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the crossbar this connection fires on.
    pub fn crossbar(&self) -> &InvalidationCrossbar {
        &self.inner.crossbar
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn next_observer_id(&self) -> u64 {
        self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_injected_failure(
        &self,
        operation: &str,
        collection: &str,
        marker: Option<&Value>,
    ) -> StoreResult<()> {
        if self.inner.config.failure_injection
            && collection == FAILURE_TEST_COLLECTION
            && marker.is_some_and(is_truthy)
        {
            return Err(StoreError::injected(operation));
        }
        Ok(())
    }

    async fn finish_write(&self, collection: &str, write: WriteToken) {
        let key = InvalidationKey::collection(collection);
        self.inner
            .crossbar
            .fire(&key, json!({ "collection": collection }))
            .await;
        write.committed();
    }

    /// Inserts a document, assigning an `_id` when it has none.
    ///
    /// Returns the document's id.
    pub async fn insert(&self, collection: &str, mut doc: Document) -> LiveResult<String> {
        self.check_injected_failure("insert", collection, doc.get("fail"))?;
        let id = doc.ensure_id()?;

        let write = WriteFence::begin_current();
        let name = collection.to_string();
        self.inner
            .gate
            .run(move |store| async move { store.insert(&name, doc).await })
            .await?;
        self.finish_write(collection, write).await;
        Ok(id)
    }

    /// Updates documents matching `selector`, returning how many changed.
    pub async fn update(
        &self,
        collection: &str,
        selector: Value,
        modifier: Modifier,
        options: UpdateOptions,
    ) -> LiveResult<u64> {
        self.check_injected_failure("update", collection, selector.get("fail"))?;
        let selector = rewrite_selector(selector)?;

        let write = WriteFence::begin_current();
        let name = collection.to_string();
        let updated = self
            .inner
            .gate
            .run(move |store| async move {
                store.update(&name, &selector, &modifier, options).await
            })
            .await?;
        self.finish_write(collection, write).await;
        Ok(updated)
    }

    /// Removes documents matching `selector`, returning how many were removed.
    pub async fn remove(&self, collection: &str, selector: Value) -> LiveResult<u64> {
        self.check_injected_failure("remove", collection, selector.get("fail"))?;
        let selector = rewrite_selector(selector)?;

        let write = WriteFence::begin_current();
        let name = collection.to_string();
        let removed = self
            .inner
            .gate
            .run(move |store| async move { store.remove(&name, &selector).await })
            .await?;
        self.finish_write(collection, write).await;
        Ok(removed)
    }

    /// Creates a cursor over documents matching `selector`.
    ///
    /// No store round-trip happens until the cursor is read.
    pub fn find(&self, collection: &str, selector: Value, options: FindOptions) -> LiveResult<Cursor> {
        let description = CursorDescription::new(collection, rewrite_selector(selector)?, options);
        Ok(Cursor::new(self.clone(), description))
    }

    /// Returns the first document matching `selector`.
    pub async fn find_one(
        &self,
        collection: &str,
        selector: Value,
        options: FindOptions,
    ) -> LiveResult<Option<Document>> {
        let mut cursor = self.find(collection, selector, options.limit(1))?;
        Ok(cursor.fetch().await?.into_iter().next())
    }

    /// Fires an invalidation key by hand.
    ///
    /// Use this after changing data through some other path, or to reach
    /// live queries listening on custom keys.
    pub async fn refresh(&self, key: &InvalidationKey) -> usize {
        self.inner.crossbar.fire(key, Value::Null).await
    }

    pub(crate) async fn fetch(&self, description: &CursorDescription) -> LiveResult<Vec<Document>> {
        let description = description.clone();
        let docs = self
            .inner
            .gate
            .run(move |store| async move {
                store
                    .find(&description.collection, &description.selector, &description.options)
                    .await
            })
            .await?;
        Ok(docs)
    }

    pub(crate) async fn count(&self, description: &CursorDescription) -> LiveResult<u64> {
        let description = description.clone();
        let count = self
            .inner
            .gate
            .run(move |store| async move {
                store
                    .count(&description.collection, &description.selector, &description.options)
                    .await
            })
            .await?;
        Ok(count)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("crossbar", &self.inner.crossbar)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Normalizes a raw selector.
///
/// - A string or number means `{_id: value}`.
/// - A falsy selector (`null`, `false`, `0`, `""`), or one whose `_id` is
///   falsy, becomes `{_id: <fresh random id>}`, which matches nothing.
///   Destructive operations must never widen to the whole collection by
///   accident.
///
/// # Errors
///
/// Returns [`StoreError::InvalidSelector`] for arrays and `true`.
pub fn rewrite_selector(raw: Value) -> StoreResult<Selector> {
    if !is_truthy(&raw) {
        return Ok(Selector::by_id(new_document_id()));
    }
    match raw {
        Value::String(_) | Value::Number(_) => {
            let mut map = serde_json::Map::new();
            map.insert(ID_FIELD.to_string(), raw);
            Ok(Selector::from_map(map))
        }
        Value::Object(map) => match map.get(ID_FIELD) {
            Some(id) if !is_truthy(id) => Ok(Selector::by_id(new_document_id())),
            _ => Ok(Selector::from_map(map)),
        },
        other => Err(StoreError::invalid_selector(format!(
            "selector must be an object, string or number, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedata_store::MemoryStore;
    use std::time::Duration;

    fn doc(value: Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[test]
    fn rewrite_scalars_to_id() {
        let selector = rewrite_selector(json!("abc")).unwrap();
        assert_eq!(selector.get(ID_FIELD), Some(&json!("abc")));

        let selector = rewrite_selector(json!(7)).unwrap();
        assert_eq!(selector.get(ID_FIELD), Some(&json!(7)));
    }

    #[test]
    fn rewrite_falsy_to_unmatchable() {
        for raw in [json!(null), json!(false), json!(0), json!(""), json!({"_id": null}), json!({"_id": ""})] {
            let selector = rewrite_selector(raw).unwrap();
            let id = selector.get(ID_FIELD).and_then(Value::as_str).unwrap();
            assert_eq!(id.len(), 36);
        }
    }

    #[test]
    fn rewrite_keeps_objects() {
        let selector = rewrite_selector(json!({"run": "r1"})).unwrap();
        assert_eq!(selector.get("run"), Some(&json!("r1")));
        assert!(rewrite_selector(json!({})).unwrap().is_empty());
        assert!(rewrite_selector(json!([1])).is_err());
    }

    #[tokio::test]
    async fn insert_assigns_id_and_fires() {
        let conn = Connection::new(Arc::new(MemoryStore::new()));
        let key = InvalidationKey::collection("items");
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        let _listener = conn.crossbar().listen(key, move |notification, done| {
            assert_eq!(notification.payload, json!({"collection": "items"}));
            counter.fetch_add(1, Ordering::SeqCst);
            done.complete();
        });

        let id = conn.insert("items", doc(json!({"x": 1}))).await.unwrap();
        assert_eq!(id.len(), 36);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let found = conn
            .find_one("items", json!(id.clone()), FindOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn failed_write_does_not_fire() {
        let conn = Connection::new(Arc::new(MemoryStore::new()));
        conn.insert("items", doc(json!({"_id": "a"}))).await.unwrap();

        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        let _listener = conn
            .crossbar()
            .listen(InvalidationKey::collection("items"), move |_, done| {
                counter.fetch_add(1, Ordering::SeqCst);
                done.complete();
            });

        let fence = WriteFence::new();
        let result = fence
            .run(conn.insert("items", doc(json!({"_id": "a"}))))
            .await;
        assert!(matches!(
            result,
            Err(crate::LiveError::Store(StoreError::DuplicateKey { .. }))
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(fence.outstanding(), 0);
    }

    #[tokio::test]
    async fn injected_failures_skip_the_store() {
        let store = Arc::new(MemoryStore::new());
        let conn = Connection::new(store.clone());

        let err = conn
            .insert(FAILURE_TEST_COLLECTION, doc(json!({"fail": true})))
            .await
            .unwrap_err();
        assert!(err.is_injected());
        assert!(store.is_empty(FAILURE_TEST_COLLECTION));

        let err = conn
            .update(
                FAILURE_TEST_COLLECTION,
                json!({"fail": true}),
                Modifier::set("x", json!(1)),
                UpdateOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_injected());

        let err = conn
            .remove(FAILURE_TEST_COLLECTION, json!({"fail": true}))
            .await
            .unwrap_err();
        assert!(err.is_injected());

        // Only the reserved collection is affected.
        conn.insert("items", doc(json!({"fail": true}))).await.unwrap();
    }

    #[tokio::test]
    async fn failure_injection_can_be_disabled() {
        let conn = Connection::open(
            Arc::new(MemoryStore::new()),
            InvalidationCrossbar::new(),
            Config::new().failure_injection(false),
        );
        conn.insert(FAILURE_TEST_COLLECTION, doc(json!({"fail": true})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deferred_connection_replays_in_order() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn DataStore> = store.clone();
        let conn = Connection::connect(
            async move {
                let _ = rx.await;
                Ok(shared)
            },
            InvalidationCrossbar::new(),
            Config::default(),
        );

        let mut writers = Vec::new();
        for i in 0..5 {
            let conn = conn.clone();
            writers.push(tokio::spawn(async move {
                conn.insert("items", doc(json!({"_id": format!("d{i}"), "i": i})))
                    .await
            }));
            // Let each writer reach the queue before the next one starts.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.is_empty("items"));

        tx.send(()).unwrap();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let ids: Vec<_> = store
            .documents("items")
            .iter()
            .map(|d| d.id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["d0", "d1", "d2", "d3", "d4"]);
    }

    #[tokio::test]
    async fn failed_connection_fails_queued_operations() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let conn = Connection::connect(
            async move {
                let _ = rx.await;
                Err(StoreError::ConnectionFailed("refused".into()))
            },
            InvalidationCrossbar::new(),
            Config::default(),
        );

        let queued = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.insert("items", doc(json!({"x": 1}))).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(()).unwrap();

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            crate::LiveError::Store(StoreError::ConnectionFailed(_))
        ));

        // Later operations fail immediately.
        let err = conn
            .remove("items", json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::LiveError::Store(StoreError::ConnectionFailed(_))
        ));
    }
}
