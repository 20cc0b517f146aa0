//! # LiveData Testkit
//!
//! Test utilities for LiveData.
//!
//! This crate provides:
//! - In-memory connections and write-fence helpers
//! - A store whose reads can be held open or failed on demand
//! - Callback recorders: a compact log and a replayed copy of the results
//! - Property-based snapshot generators using proptest
//! - A seeded convergence fuzz harness for live queries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livedata_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn observes_inserts() {
//!     let conn = TestConnection::memory();
//!     let log = CallbackLog::new("x");
//!     let _query = conn
//!         .find(TEST_COLLECTION, json!({}), FindOptions::default())?
//!         .observe(log.callbacks())
//!         .await?;
//!     fenced(conn.insert(TEST_COLLECTION, doc(json!({"x": 1})))).await?;
//!     assert_eq!(log.take(), "a(1,0)");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod controlled;
pub mod fixtures;
pub mod fuzz;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::controlled::*;
    pub use crate::fixtures::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
}

pub use controlled::*;
pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
