//! # devito-cache
//!
//! Stat-gated caches for the devito dev server.
//!
//! A [`ResourceCache`] maps a [`CacheKey`] to a payload computed at most once
//! per [`StatSignature`] of the key's file. Concurrent requests for the same
//! key share one computation; failures are never cached. Every cache is
//! registered with a [`CacheManager`], which evicts a changed file from all
//! of them at once.
//!
//! ```rust,no_run
//! use devito_cache::{CacheKey, CacheManager, CacheError};
//! use devito_graph::NativeRuntime;
//! use std::sync::Arc;
//!
//! # async fn run() -> devito_cache::Result<()> {
//! let manager = CacheManager::new();
//! let lengths = manager.create::<usize, CacheError>("lengths", Arc::new(NativeRuntime::new()));
//!
//! let cached = lengths
//!     .get_or_create(CacheKey::new("/tmp/a.txt"), |key, _sig| async move {
//!         Ok(std::fs::read(&key.path).map(|b| b.len()).unwrap_or(0))
//!     })
//!     .await?;
//! println!("{} bytes (etag {})", cached.payload, cached.signature.etag());
//!
//! manager.forget(std::path::Path::new("/tmp/a.txt"));
//! # Ok(())
//! # }
//! ```

pub mod deferred;
mod error;
mod key;
pub mod manager;
pub mod resource;
pub mod transforms;

pub use deferred::{Abandoned, Deferred, Pending};
pub use devito_graph::StatSignature;
pub use error::{CacheError, Result};
pub use key::CacheKey;
pub use manager::{CacheManager, CacheStats, Evict};
pub use resource::{Cached, ResourceCache};
pub use transforms::{DerivedSources, SourceText};
