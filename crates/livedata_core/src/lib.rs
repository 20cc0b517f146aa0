//! # LiveData Core
//!
//! Live query engine for LiveData.
//!
//! This crate provides:
//! - [`Connection`] - straight-line access to a [`DataStore`](livedata_store::DataStore)
//! - [`Cursor`] - lazily evaluated queries
//! - [`LiveQuery`] - ordered result sets that report every change as callbacks
//! - [`InvalidationCrossbar`] - routes "this changed" from writers to live queries
//! - [`WriteFence`] - lets a writer wait until its writes are visible to observers
//! - [`diff_ordered`] - the ordered snapshot diff behind live queries
//!
//! ## Example
//!
//! ```rust
//! use livedata_core::{Connection, ObserveCallbacks, WriteFence};
//! use livedata_store::{Document, FindOptions, MemoryStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let conn = Connection::new(Arc::new(MemoryStore::new()));
//!     let query = conn
//!         .find("items", json!({}), FindOptions::default())
//!         .unwrap()
//!         .observe(ObserveCallbacks::new().added(|doc, before| {
//!             println!("added {:?} before {before}", doc.id());
//!         }))
//!         .await
//!         .unwrap();
//!
//!     let fence = WriteFence::new();
//!     fence
//!         .run(conn.insert("items", Document::try_from(json!({"x": 1})).unwrap()))
//!         .await
//!         .unwrap();
//!     assert_eq!(query.snapshot().len(), 1);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod crossbar;
mod cursor;
mod diff;
mod error;
mod fence;
mod live_query;

pub use config::Config;
pub use connection::{rewrite_selector, Connection, FAILURE_TEST_COLLECTION};
pub use crossbar::{
    Completion, InvalidationCrossbar, InvalidationKey, ListenerFn, ListenerHandle, ListenerId,
    Notification,
};
pub use cursor::{Cursor, CursorDescription};
pub use diff::{apply_changes, diff_ordered, Change, DiffOutcome};
pub use error::{DiffError, LiveError, LiveResult};
pub use fence::{WriteFence, WriteToken};
pub use live_query::{LiveQuery, LiveQueryState, LiveQueryStats, ObserveCallbacks};
