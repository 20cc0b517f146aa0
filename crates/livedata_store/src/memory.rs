//! In-memory document store for testing.

use crate::backend::DataStore;
use crate::document::Document;
use crate::error::{StoreError, StoreResult};
use crate::modifier::Modifier;
use crate::options::{FindOptions, UpdateOptions};
use crate::selector::Selector;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// An in-memory document store.
///
/// Documents are kept per collection in insertion order. Every operation
/// yields to the scheduler once before touching the data, so callers see
/// the same suspension points they would against a networked store.
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across tasks behind an
/// `Arc`.
///
/// # Example
///
/// ```rust
/// use livedata_store::{DataStore, Document, MemoryStore};
/// use serde_json::json;
///
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// rt.block_on(async {
///     let store = MemoryStore::new();
///     let doc = Document::try_from(json!({"_id": "a"})).unwrap();
///     store.insert("items", doc).await.unwrap();
///     assert_eq!(store.len("items"), 1);
/// });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    /// Rotate runs of equal-sorting documents on every find.
    unstable_order: bool,
    finds: AtomicU64,
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that returns equal-sorting documents in a
    /// different order on every `find`.
    ///
    /// Useful for exercising consumers that must not rely on ordering
    /// stability.
    #[must_use]
    pub fn with_unstable_order() -> Self {
        Self {
            unstable_order: true,
            ..Self::default()
        }
    }

    /// Returns the number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, |docs| docs.len())
    }

    /// Returns true if the collection has no documents.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Returns a copy of a collection in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn matching(&self, collection: &str, selector: &Selector) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for doc in docs {
            if selector.matches(doc)? {
                out.push(doc.clone());
            }
        }
        Ok(out)
    }

    fn rotate_ties(&self, docs: &mut [Document], options: &FindOptions) {
        let shift = self.finds.fetch_add(1, AtomicOrdering::Relaxed) as usize;
        let mut start = 0;
        while start < docs.len() {
            let mut end = start + 1;
            while end < docs.len() && options.compare(&docs[start], &docs[end]) == Ordering::Equal
            {
                end += 1;
            }
            let run = end - start;
            if run > 1 {
                docs[start..end].rotate_left(shift % run);
            }
            start = end;
        }
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn insert(&self, collection: &str, doc: Document) -> StoreResult<()> {
        tokio::task::yield_now().await;

        let id = doc.require_id()?.to_string();
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.iter().any(|d| d.id() == Some(id.as_str())) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                id,
            });
        }
        docs.push(doc);
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        selector: &Selector,
        modifier: &Modifier,
        options: UpdateOptions,
    ) -> StoreResult<u64> {
        tokio::task::yield_now().await;

        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();

        let mut updated = 0u64;
        for doc in docs.iter_mut() {
            if !selector.matches(doc)? {
                continue;
            }
            // Apply to a copy so a failing modifier leaves the document intact.
            let mut next = doc.clone();
            modifier.apply(&mut next)?;
            *doc = next;
            updated += 1;
            if !options.multi {
                break;
            }
        }

        if updated == 0 && options.upsert {
            let mut doc = Document::from(selector.equality_fields());
            modifier.apply(&mut doc)?;
            doc.ensure_id()?;
            docs.push(doc);
            updated = 1;
        }

        Ok(updated)
    }

    async fn remove(&self, collection: &str, selector: &Selector) -> StoreResult<u64> {
        tokio::task::yield_now().await;

        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };

        // Evaluate first so an invalid selector removes nothing.
        let mut keep = Vec::with_capacity(docs.len());
        for doc in docs.iter() {
            keep.push(!selector.matches(doc)?);
        }
        let before = docs.len();
        let mut flags = keep.into_iter();
        docs.retain(|_| flags.next().unwrap_or(true));
        Ok((before - docs.len()) as u64)
    }

    async fn find(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        tokio::task::yield_now().await;

        let mut docs = self.matching(collection, selector)?;
        docs.sort_by(|a, b| options.compare(a, b));
        if self.unstable_order {
            self.rotate_ties(&mut docs, options);
        }
        Ok(options.window(docs))
    }

    async fn count(
        &self,
        collection: &str,
        selector: &Selector,
        _options: &FindOptions,
    ) -> StoreResult<u64> {
        tokio::task::yield_now().await;

        Ok(self.matching(collection, selector)?.len() as u64)
    }
}
