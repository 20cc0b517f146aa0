//! A store whose reads can be held open or failed on demand.
//!
//! Lets tests place writes, stops and failures exactly while a live query
//! is in the middle of a poll.

use async_trait::async_trait;
use livedata_core::{Config, Connection};
use livedata_store::{
    DataStore, Document, FindOptions, MemoryStore, Modifier, Selector, StoreError, StoreResult,
    UpdateOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Wraps a [`MemoryStore`], counting finds and letting tests hold or fail
/// them. Writes and counts pass straight through.
#[derive(Debug)]
pub struct ControlledStore {
    inner: MemoryStore,
    held: watch::Sender<bool>,
    finds: watch::Sender<usize>,
    failing_finds: AtomicUsize,
}

impl Default for ControlledStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlledStore {
    /// Creates an empty store that serves finds immediately.
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            held: watch::channel(false).0,
            finds: watch::channel(0).0,
            failing_finds: AtomicUsize::new(0),
        }
    }

    /// Creates a connection to a fresh controlled store.
    pub fn connect(config: Config) -> (Connection, Arc<Self>) {
        let store = Arc::new(Self::new());
        let conn = Connection::with_config(store.clone(), config);
        (conn, store)
    }

    /// Returns the wrapped store.
    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// Makes every find started from now on wait until [`Self::release`].
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    /// Lets held and future finds proceed.
    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Makes the next `count` finds fail with a connection error.
    pub fn fail_next_finds(&self, count: usize) {
        self.failing_finds.store(count, Ordering::SeqCst);
    }

    /// Returns how many finds have started.
    pub fn finds(&self) -> usize {
        *self.finds.borrow()
    }

    /// Waits until at least `count` finds have started.
    ///
    /// Returns false if that did not happen within `timeout`.
    pub async fn wait_for_finds(&self, count: usize, timeout: Duration) -> bool {
        let mut finds = self.finds.subscribe();
        tokio::time::timeout(timeout, finds.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|seen| seen.is_ok())
    }

    fn take_failure(&self) -> bool {
        self.failing_finds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DataStore for ControlledStore {
    async fn insert(&self, collection: &str, doc: Document) -> StoreResult<()> {
        self.inner.insert(collection, doc).await
    }

    async fn update(
        &self,
        collection: &str,
        selector: &Selector,
        modifier: &Modifier,
        options: UpdateOptions,
    ) -> StoreResult<u64> {
        self.inner.update(collection, selector, modifier, options).await
    }

    async fn remove(&self, collection: &str, selector: &Selector) -> StoreResult<u64> {
        self.inner.remove(collection, selector).await
    }

    async fn find(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let mut held = self.held.subscribe();
        self.finds.send_modify(|n| *n += 1);
        // The sender lives as long as `self`, so this only waits.
        let _ = held.wait_for(|held| !*held).await;

        if self.take_failure() {
            return Err(StoreError::ConnectionFailed("find failed on demand".into()));
        }
        self.inner.find(collection, selector, options).await
    }

    async fn count(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> StoreResult<u64> {
        self.inner.count(collection, selector, options).await
    }
}
