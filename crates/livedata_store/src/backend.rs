//! Data store trait definition.

use crate::document::Document;
use crate::error::StoreResult;
use crate::modifier::Modifier;
use crate::options::{FindOptions, UpdateOptions};
use crate::selector::Selector;
use async_trait::async_trait;

/// An asynchronous document store.
///
/// Every method is a round-trip to the store and a suspension point for
/// the caller. LiveData never assumes anything about result ordering
/// beyond the sort it asks for: documents that compare equal may come
/// back in a different order on every call.
///
/// # Invariants
///
/// - `insert` receives documents that already carry a string `_id`
/// - `find` returns each matching document at most once
/// - A write that returned `Ok` is visible to every later `find`
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For testing
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Inserts a document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::DuplicateKey`] if the `_id` exists.
    async fn insert(&self, collection: &str, doc: Document) -> StoreResult<()>;

    /// Updates the first (or, with `multi`, every) matching document.
    ///
    /// Returns the number of documents updated or inserted.
    async fn update(
        &self,
        collection: &str,
        selector: &Selector,
        modifier: &Modifier,
        options: UpdateOptions,
    ) -> StoreResult<u64>;

    /// Removes every matching document, returning how many were removed.
    async fn remove(&self, collection: &str, selector: &Selector) -> StoreResult<u64>;

    /// Returns the matching documents in sort order.
    async fn find(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>>;

    /// Counts matching documents, ignoring skip and limit.
    async fn count(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> StoreResult<u64>;
}
