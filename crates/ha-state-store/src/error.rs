//! Error types for the state store and the computed state engine

use ha_core::{RemoteError, ValueKind};
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned to callers of the store
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Unknown key, or a registered key that has not been synchronized yet
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("type mismatch for {key}: expected {expected}, stored {actual}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: ValueKind,
    },

    #[error("{key} is read-only")]
    ReadOnly { key: String },

    /// Derived keys are written only by the computed state engine
    #[error("{key} is computed and cannot be set directly")]
    ComputedKey { key: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl StoreError {
    pub(crate) fn not_found(key: &str) -> Self {
        StoreError::NotFound {
            key: key.to_string(),
        }
    }

    pub(crate) fn mismatch(key: &str, expected: ValueKind, actual: ValueKind) -> Self {
        StoreError::TypeMismatch {
            key: key.to_string(),
            expected: expected.as_str(),
            actual,
        }
    }
}

/// Configuration errors raised when registering a computed key
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComputedError {
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("unknown key: {key}")]
    UnknownKey { key: String },

    #[error("{key} is already computed")]
    AlreadyRegistered { key: String },

    #[error("{key} depends on itself")]
    SelfDependency { key: String },

    #[error("{key} has no dependencies")]
    EmptyDependencies { key: String },
}
