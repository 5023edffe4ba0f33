//! # devito-core
//!
//! Build coordination for the devito dev server.
//!
//! - [`BuildCoordinator`] runs debounced, generation-checked bundled builds
//!   and serves the last good [`ArtifactMap`] while a rebuild is in flight
//!   or after one fails.
//! - [`OnDemandBuilder`] compiles single files for unbundled serving.
//! - [`ChangeBus`] fans `start`/`update`/`error` messages out to clients.
//! - [`WatchRegistry`] turns filesystem events for the current input set into
//!   invalidations.
//!
//! The bundler itself is a [`Compiler`] supplied by the embedder.
//!
//! ```rust,no_run
//! use devito_cache::{CacheManager, DerivedSources};
//! use devito_core::{BuildCoordinator, BusNotifier, ChangeBus, Compiler, CoordinatorOptions, NotifyWatcher};
//! use devito_graph::NativeRuntime;
//! use std::sync::Arc;
//!
//! # async fn run(compiler: Arc<dyn Compiler>) -> devito_core::Result<()> {
//! let runtime = Arc::new(NativeRuntime::new());
//! let caches = Arc::new(CacheManager::new());
//! let sources = DerivedSources::new(&caches, runtime, "/");
//! let bus = ChangeBus::new();
//!
//! let coordinator = BuildCoordinator::new(
//!     CoordinatorOptions::new("/app/src/index.ts"),
//!     compiler,
//!     sources,
//!     caches,
//!     Arc::new(NotifyWatcher::new()),
//!     Arc::new(BusNotifier::new(bus.clone())),
//! );
//! coordinator.initial_build().await?;
//! let bundle = coordinator.artifacts();
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod bus;
pub mod compiler;
pub mod coordinator;
pub mod debounce;
mod error;
pub mod observer;
pub mod on_demand;
pub mod watch;

pub use artifact::{content_type_for, Artifact, ArtifactMap, ArtifactMeta};
pub use bus::{BroadcastReport, BusMessage, ChangeBus, ClientChannel};
pub use compiler::{CompileOutput, CompileRequest, Compiler, SourceMapMode};
pub use coordinator::{BuildCoordinator, BuildStatus, CoordinatorOptions, DEFAULT_DEBOUNCE};
pub use debounce::Debouncer;
pub use error::{BuildError, CompileFailure, Diagnostic, Result, TransportFailure};
pub use observer::{BuildObserver, BusNotifier, NoopObserver, BUNDLE_PATHS};
pub use on_demand::OnDemandBuilder;
pub use watch::{FileChange, FileWatcher, NotifyWatcher, WatchRegistry, WatchSet, WatchSubscription};

#[cfg(test)]
mod tests;
