//! In-memory runtime for tests.
//!
//! Directories are implied by the files stored beneath them. Every write bumps
//! a logical clock that is reported as the modification time, so rewriting a
//! file always changes its `StatSignature` even when the size stays the same.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{node, FileMetadata, Runtime, RuntimeError, RuntimeResult};

#[derive(Debug, Clone)]
struct MemoryFile {
    content: Vec<u8>,
    modified: u64,
}

/// Runtime backed by a map of absolute paths to file contents.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    files: Mutex<FxHashMap<PathBuf, MemoryFile>>,
    clock: AtomicU64,
    reads: AtomicUsize,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a file.
    pub fn write(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        let modified = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.files.lock().insert(
            path.into(),
            MemoryFile {
                content: content.into(),
                modified,
            },
        );
    }

    /// Remove a file.
    pub fn remove(&self, path: &Path) {
        self.files.lock().remove(path);
    }

    /// Number of `read_file` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.files
            .lock()
            .keys()
            .any(|file| file != path && file.starts_with(path))
    }
}

#[async_trait]
impl Runtime for MemoryRuntime {
    async fn read_file(&self, path: &Path) -> RuntimeResult<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .get(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| RuntimeError::FileNotFound(path.to_path_buf()))
    }

    async fn metadata(&self, path: &Path) -> RuntimeResult<FileMetadata> {
        if let Some(file) = self.files.lock().get(path) {
            return Ok(FileMetadata {
                size: file.content.len() as u64,
                is_dir: false,
                is_file: true,
                modified: Some(file.modified),
            });
        }
        if self.is_dir(path) {
            return Ok(FileMetadata {
                size: 0,
                is_dir: true,
                is_file: false,
                modified: None,
            });
        }
        Err(RuntimeError::FileNotFound(path.to_path_buf()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path) || self.is_dir(path)
    }

    async fn canonicalize(&self, path: &Path) -> RuntimeResult<PathBuf> {
        if self.exists(path) {
            Ok(path.to_path_buf())
        } else {
            Err(RuntimeError::FileNotFound(path.to_path_buf()))
        }
    }

    async fn resolve_external(
        &self,
        specifier: &str,
        from_dir: &Path,
    ) -> RuntimeResult<Option<PathBuf>> {
        node::resolve_package(self, specifier, from_dir).await
    }
}
