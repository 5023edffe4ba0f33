//! Native Runtime Implementation
//!
//! Wraps `std::fs` behind the `Runtime` trait. Blocking calls run on tokio's
//! blocking pool so they never stall the event loop that serves requests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::task;

use super::{node, FileMetadata, Runtime, RuntimeError, RuntimeResult};

/// Native filesystem Runtime implementation using `std::fs`.
///
/// # Example
///
/// ```rust,no_run
/// use devito_graph::runtime::{native::NativeRuntime, Runtime};
/// use std::path::Path;
///
/// # async fn run() -> devito_graph::runtime::RuntimeResult<()> {
/// let runtime = NativeRuntime::new();
/// let meta = runtime.metadata(Path::new("src/index.ts")).await?;
/// println!("{} bytes", meta.size);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeRuntime;

impl NativeRuntime {
    /// Create a new NativeRuntime instance.
    pub fn new() -> Self {
        Self
    }
}

fn io_error(path: &Path, action: &str, e: std::io::Error) -> RuntimeError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RuntimeError::FileNotFound(path.to_path_buf())
    } else {
        RuntimeError::Io(format!("Failed to {} {}: {}", action, path.display(), e))
    }
}

#[async_trait]
impl Runtime for NativeRuntime {
    async fn read_file(&self, path: &Path) -> RuntimeResult<Vec<u8>> {
        let path = path.to_path_buf();

        task::spawn_blocking(move || std::fs::read(&path).map_err(|e| io_error(&path, "read", e)))
            .await
            .map_err(|e| RuntimeError::Other(format!("Task join error: {}", e)))?
    }

    async fn metadata(&self, path: &Path) -> RuntimeResult<FileMetadata> {
        let path = path.to_path_buf();

        task::spawn_blocking(move || {
            let metadata =
                std::fs::metadata(&path).map_err(|e| io_error(&path, "get metadata for", e))?;

            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64);

            Ok(FileMetadata {
                size: metadata.len(),
                is_dir: metadata.is_dir(),
                is_file: metadata.is_file(),
                modified,
            })
        })
        .await
        .map_err(|e| RuntimeError::Other(format!("Task join error: {}", e)))?
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    async fn canonicalize(&self, path: &Path) -> RuntimeResult<PathBuf> {
        let path = path.to_path_buf();

        task::spawn_blocking(move || {
            std::fs::canonicalize(&path).map_err(|e| io_error(&path, "canonicalize", e))
        })
        .await
        .map_err(|e| RuntimeError::Other(format!("Task join error: {}", e)))?
    }

    async fn resolve_external(
        &self,
        specifier: &str,
        from_dir: &Path,
    ) -> RuntimeResult<Option<PathBuf>> {
        node::resolve_package(self, specifier, from_dir).await
    }
}
