//! # devito-graph
//!
//! Filesystem runtime and dependency graph resolution for unbundled serving.
//!
//! ## Overview
//!
//! - [`runtime`]: the [`Runtime`] trait every filesystem access goes through,
//!   with a native implementation and Node-style package resolution.
//! - [`resolver`]: specifier resolution (aliases, relative paths with
//!   extension/index/`package.json` fallbacks, bare packages).
//! - [`walker`]: the [`Analyzer`], which walks imports from an entry, rewrites
//!   specifiers into browser-loadable ones and records every reachable file
//!   in a shared [`DependencyCache`].
//!
//! ```text
//!   entry ──► Analyzer ──► ModuleResolver ──► Runtime
//!               │
//!               └──► DependencyCache (records + import map)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devito_graph::{AnalyzeOptions, Analyzer, DependencyCache, NativeRuntime};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> devito_graph::Result<()> {
//! let records = Arc::new(DependencyCache::new());
//! let analyzer = Analyzer::new(Arc::new(NativeRuntime::new()), records.clone());
//! let options = AnalyzeOptions::new("/home/me").with_external_resolution(true);
//!
//! let files = analyzer
//!     .analyze_all(Path::new("/home/me/app/index.ts"), &options)
//!     .await?;
//! println!("{} files, import map {}", files.len(), records.import_map().to_json());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod paths;
pub mod record;
pub mod resolver;
pub mod runtime;
pub mod walker;
pub mod wrap;

pub use config::AnalyzeOptions;
pub use paths::{fs_path, fs_url, relative_specifier, FS_PREFIX};
pub use record::{DependencyCache, DependencyRecord, ImportEntry, ImportMap};
pub use resolver::{AliasTable, ModuleResolver, Resolution};
pub use runtime::native::NativeRuntime;
pub use runtime::{FileMetadata, Runtime, RuntimeError, RuntimeResult, StatSignature};
pub use walker::{AnalyzeError, Analyzer, Result};
pub use wrap::SourceKind;
