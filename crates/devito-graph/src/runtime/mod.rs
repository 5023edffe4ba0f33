//! Filesystem runtime abstraction for devito.
//!
//! This module defines the `Runtime` trait that abstracts the filesystem
//! primitives the dev server needs: reading, stat-ing and resolving package
//! specifiers. The native implementation wraps `std::fs`; tests use an
//! in-memory runtime so cache and invalidation logic can be exercised without
//! touching the disk.

pub mod native;
pub mod node;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur during runtime operations.
///
/// Payloads are plain strings so the error can be cloned and handed to every
/// waiter of a coalesced request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// File not found
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Other runtime error
    #[error("Runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether this error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::FileNotFound(_))
    }
}

/// File metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
    /// Whether this is a file
    pub is_file: bool,
    /// Last modified timestamp (milliseconds since epoch)
    pub modified: Option<u64>,
}

impl FileMetadata {
    /// The staleness oracle for this file.
    pub fn signature(&self) -> StatSignature {
        StatSignature {
            modified_ms: self.modified.unwrap_or(0),
            byte_size: self.size,
        }
    }
}

/// Modification time + size pair used as a cheap proxy for "file changed".
///
/// Content is never hashed: two signatures are equal iff both fields match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatSignature {
    /// Last modified timestamp (milliseconds since epoch)
    pub modified_ms: u64,
    /// File size in bytes
    pub byte_size: u64,
}

impl StatSignature {
    pub fn new(modified_ms: u64, byte_size: u64) -> Self {
        Self {
            modified_ms,
            byte_size,
        }
    }

    /// HTTP entity tag in the `"<size hex>-<mtime hex>"` form.
    pub fn etag(&self) -> String {
        format!("\"{:x}-{:x}\"", self.byte_size, self.modified_ms)
    }
}

/// Platform runtime trait
///
/// Everything above the runtime (resolver, caches, coordinator) goes through
/// this trait, so swapping the filesystem for an in-memory one is enough to
/// drive the whole engine in tests.
#[async_trait]
pub trait Runtime: Send + Sync + std::fmt::Debug {
    /// Read a file from the filesystem
    async fn read_file(&self, path: &Path) -> RuntimeResult<Vec<u8>>;

    /// Get file metadata
    async fn metadata(&self, path: &Path) -> RuntimeResult<FileMetadata>;

    /// Check if a path exists
    fn exists(&self, path: &Path) -> bool;

    /// Resolve the realpath of a path (symlinks followed).
    async fn canonicalize(&self, path: &Path) -> RuntimeResult<PathBuf>;

    /// Resolve a bare package specifier starting from `from_dir`.
    ///
    /// Returns `Ok(None)` when no package provides the specifier.
    async fn resolve_external(
        &self,
        specifier: &str,
        from_dir: &Path,
    ) -> RuntimeResult<Option<PathBuf>>;

    /// Read a file as UTF-8 text.
    async fn read_to_string(&self, path: &Path) -> RuntimeResult<String> {
        let bytes = self.read_file(path).await?;
        String::from_utf8(bytes).map_err(|e| {
            RuntimeError::Io(format!("Invalid UTF-8 in {}: {}", path.display(), e))
        })
    }
}
