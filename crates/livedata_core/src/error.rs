//! Error types for LiveData core.

use livedata_store::StoreError;
use thiserror::Error;

/// Result type for core operations.
pub type LiveResult<T> = Result<T, LiveError>;

/// Errors that can occur in LiveData core operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LiveError {
    /// The store (or fault injection) rejected the operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The diff between two snapshots violated an internal invariant.
    #[error("diff error: {0}")]
    Diff(#[from] DiffError),

    /// The live query has been stopped.
    #[error("live query {id} is stopped")]
    Stopped {
        /// Observer id of the stopped query.
        id: u64,
    },
}

impl LiveError {
    /// Returns true if this error came from fault injection.
    pub fn is_injected(&self) -> bool {
        matches!(self, LiveError::Store(e) if e.is_injected())
    }
}

/// Internal invariant violations detected while diffing two snapshots.
///
/// These indicate a defect (or a store returning malformed results), never
/// a user-facing condition. The poll cycle that hit one is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    /// A snapshot contains a document without a string `_id`.
    #[error("document without _id at index {index}")]
    MissingId {
        /// Position in the offending snapshot.
        index: usize,
    },

    /// A snapshot contains the same key twice.
    #[error("duplicate key {id} in snapshot")]
    DuplicateKey {
        /// The repeated key.
        id: String,
    },

    /// A key expected in the working array is not there.
    #[error("document {id} missing from results")]
    MissingDocument {
        /// The key that could not be found.
        id: String,
    },

    /// After removals, the stable parts of both snapshots differ in size.
    #[error("snapshot sizes differ after removals: old {old}, new {new}")]
    LengthMismatch {
        /// Stable documents remaining in the old snapshot.
        old: usize,
        /// Stable documents remaining in the new snapshot.
        new: usize,
    },
}
