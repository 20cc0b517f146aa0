//! # LiveData Store
//!
//! Document store abstraction for LiveData.
//!
//! This crate provides the lowest layer the live query engine talks to:
//! a JSON document model, the small selector/modifier vocabulary the
//! engine needs, and the asynchronous [`DataStore`] trait.
//!
//! ## Design Principles
//!
//! - Stores are asynchronous; callers suspend at every store round-trip
//! - Stores know nothing about observers, fences or invalidation
//! - Stores give no ordering guarantee beyond the requested sort
//! - Must be `Send + Sync` so one store can back many live queries
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral data
//!
//! ## Example
//!
//! ```rust
//! use livedata_store::{DataStore, Document, FindOptions, MemoryStore, Selector};
//! use serde_json::json;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let store = MemoryStore::new();
//!     let doc = Document::try_from(json!({"_id": "a", "x": 1})).unwrap();
//!     store.insert("items", doc).await.unwrap();
//!
//!     let found = store
//!         .find("items", &Selector::all(), &FindOptions::default())
//!         .await
//!         .unwrap();
//!     assert_eq!(found.len(), 1);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod document;
mod error;
mod memory;
mod modifier;
mod options;
mod selector;

pub use backend::DataStore;
pub use document::{new_document_id, Document, ID_FIELD};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use modifier::Modifier;
pub use options::{FindOptions, SortKey, SortOrder, UpdateOptions};
pub use selector::{compare_values, is_truthy, Selector};
