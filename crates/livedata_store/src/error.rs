//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The connection to the store could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A deliberately injected failure (fault-injection test collection).
    #[error("failure test: {operation} rejected by fault injection")]
    InjectedFailure {
        /// The operation that was rejected (`insert`, `update`, `remove`).
        operation: String,
    },

    /// A document with the same primary key already exists.
    #[error("duplicate key: {id} in collection {collection}")]
    DuplicateKey {
        /// The collection written to.
        collection: String,
        /// The conflicting primary key.
        id: String,
    },

    /// The document is not a valid store document.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// The modifier could not be interpreted or applied.
    #[error("invalid modifier: {0}")]
    InvalidModifier(String),

    /// The selector could not be interpreted.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
}

impl StoreError {
    /// Creates an injected failure error.
    pub fn injected(operation: impl Into<String>) -> Self {
        Self::InjectedFailure {
            operation: operation.into(),
        }
    }

    /// Creates an invalid document error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument(message.into())
    }

    /// Creates an invalid modifier error.
    pub fn invalid_modifier(message: impl Into<String>) -> Self {
        Self::InvalidModifier(message.into())
    }

    /// Creates an invalid selector error.
    pub fn invalid_selector(message: impl Into<String>) -> Self {
        Self::InvalidSelector(message.into())
    }

    /// Returns true if this error was produced by fault injection.
    pub fn is_injected(&self) -> bool {
        matches!(self, StoreError::InjectedFailure { .. })
    }
}
