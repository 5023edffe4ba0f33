//! Error types for devito-cache.

use devito_graph::RuntimeError;
use std::path::PathBuf;

use crate::deferred::Abandoned;

/// Errors produced by resource caches.
///
/// Clone so one failure can be handed to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The resource to stat or read does not exist.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Stat or read failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// The compute function failed.
    #[error("compute failed: {0}")]
    Compute(String),

    /// The computation was dropped before producing a value.
    #[error("computation interrupted before it settled")]
    Interrupted,
}

impl From<RuntimeError> for CacheError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::FileNotFound(path) => CacheError::NotFound(path),
            RuntimeError::Io(msg) | RuntimeError::Other(msg) => CacheError::Io(msg),
        }
    }
}

impl From<Abandoned> for CacheError {
    fn from(_: Abandoned) -> Self {
        CacheError::Interrupted
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
