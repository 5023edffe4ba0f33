//! Incremental bundle coordinator.
//!
//! Owns the current [`ArtifactMap`] and the build generation counter. Every
//! build bumps the generation; a result is applied only if its generation is
//! still the current one when it completes, so a slow stale build can never
//! overwrite a newer one. Superseded builds are not aborted, just ignored.
//!
//! After each successful build the watch set is rebuilt from the compiler's
//! input list. A change to a watched file is evicted from every cache as soon
//! as it arrives; the observer and the rebuild wait for the debounce window.

use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use devito_cache::{CacheManager, Deferred, DerivedSources};

use crate::artifact::{now_ms, ArtifactMap};
use crate::compiler::{CompileRequest, Compiler, SourceMapMode};
use crate::debounce::Debouncer;
use crate::error::{BuildError, Result};
use crate::observer::BuildObserver;
use crate::watch::{ChangeSink, FileWatcher, WatchRegistry, WatchSet};

/// Default quiescence window for rebuild triggers.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Build status tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    /// No build has been started yet
    Idle,
    /// A build of this generation is in progress
    Building { generation: u64 },
    /// This generation is being served
    Applied { generation: u64, duration_ms: u64 },
    /// This generation failed; earlier artifacts (if any) are still served
    Failed { generation: u64, message: String },
}

impl BuildStatus {
    /// Check if build is currently running.
    pub fn is_building(&self) -> bool {
        matches!(self, BuildStatus::Building { .. })
    }

    /// Check if last build succeeded.
    pub fn is_applied(&self) -> bool {
        matches!(self, BuildStatus::Applied { .. })
    }

    pub fn generation(&self) -> u64 {
        match self {
            BuildStatus::Idle => 0,
            BuildStatus::Building { generation }
            | BuildStatus::Applied { generation, .. }
            | BuildStatus::Failed { generation, .. } => *generation,
        }
    }

    /// Get error message if failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            BuildStatus::Failed { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// What to build and how.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub entry: PathBuf,
    /// Build this text instead of the entry file's contents.
    pub entry_source: Option<String>,
    pub debounce: Duration,
    pub source_maps: SourceMapMode,
    /// Base name of outputs, `bundle` for `/bundle.js`.
    pub output_name: String,
}

impl CoordinatorOptions {
    pub fn new(entry: impl Into<PathBuf>) -> Self {
        Self {
            entry: entry.into(),
            entry_source: None,
            debounce: DEFAULT_DEBOUNCE,
            source_maps: SourceMapMode::default(),
            output_name: "bundle".to_string(),
        }
    }

    pub fn with_entry_source(mut self, source: impl Into<String>) -> Self {
        self.entry_source = Some(source.into());
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_source_maps(mut self, mode: SourceMapMode) -> Self {
        self.source_maps = mode;
        self
    }

    fn css_path(&self) -> String {
        format!("/{}.css", self.output_name)
    }
}

struct BuildState {
    generation: u64,
    pending: Deferred<(), BuildError>,
    status: BuildStatus,
}

/// Drives bundled rebuilds and publishes their artifacts.
pub struct BuildCoordinator {
    options: CoordinatorOptions,
    compiler: Arc<dyn Compiler>,
    sources: DerivedSources,
    caches: Arc<CacheManager>,
    observer: Arc<dyn BuildObserver>,
    state: Mutex<BuildState>,
    artifacts: RwLock<Arc<ArtifactMap>>,
    triggers: Debouncer<Option<PathBuf>>,
    watches: WatchRegistry,
}

impl std::fmt::Debug for BuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCoordinator")
            .field("entry", &self.options.entry)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl BuildCoordinator {
    /// Create a coordinator. Must be called inside a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `options` - Entry point and build settings
    /// * `compiler` - Bundler invoked for every build
    /// * `sources` - Derived sources; primed with `entry_source` before each build
    /// * `caches` - Manager whose caches are evicted on file changes
    /// * `watcher` - Source of file change events
    /// * `observer` - Lifecycle hooks
    pub fn new(
        options: CoordinatorOptions,
        compiler: Arc<dyn Compiler>,
        sources: DerivedSources,
        caches: Arc<CacheManager>,
        watcher: Arc<dyn FileWatcher>,
        observer: Arc<dyn BuildObserver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let on_batch = this.clone();
            let triggers = Debouncer::new(options.debounce, move |batch: Vec<Option<PathBuf>>| {
                let this = on_batch.clone();
                async move {
                    if let Some(this) = this.upgrade() {
                        this.handle_triggers(batch).await;
                    }
                }
            });

            let on_change = this.clone();
            let sink: ChangeSink = Arc::new(move |change| {
                if let Some(this) = on_change.upgrade() {
                    this.notify_change(change.into_path());
                }
            });

            Self {
                options,
                compiler,
                sources,
                caches,
                observer,
                state: Mutex::new(BuildState {
                    generation: 0,
                    pending: Deferred::new(),
                    status: BuildStatus::Idle,
                }),
                artifacts: RwLock::new(Arc::new(ArtifactMap::new())),
                triggers,
                watches: WatchRegistry::new(watcher, sink),
            }
        })
    }

    /// Request a rebuild. Calls within the debounce window collapse into one
    /// build that starts after the last call.
    pub fn rebuild(&self) {
        self.triggers.schedule(None);
    }

    /// Report a changed file as if the watcher had seen it.
    ///
    /// Its cache entries go right away, so a request served during the
    /// debounce window reads the file again instead of the old entry.
    pub fn notify_change(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let evicted = self.caches.forget(&path);
        tracing::trace!("{} changed, evicted {} cache entries", path.display(), evicted);
        self.triggers.schedule(Some(path));
    }

    /// Start a build now, superseding any build in flight. Returns its
    /// generation.
    pub fn start_build(self: &Arc<Self>) -> u64 {
        let (generation, superseded) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let generation = state.generation;
            state.status = BuildStatus::Building { generation };
            let superseded = std::mem::replace(&mut state.pending, Deferred::new());
            (generation, superseded)
        };

        let previous = generation - 1;
        if superseded.reject(BuildError::Interrupted {
            generation: previous,
        }) && previous > 0
        {
            tracing::debug!("build {} superseded by {}", previous, generation);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(generation).await });
        generation
    }

    /// Run the first build and wait for it to settle.
    pub async fn initial_build(self: &Arc<Self>) -> Result<()> {
        self.start_build();
        self.wait_for_build().await
    }

    /// Wait for the latest build to settle.
    ///
    /// If that build is superseded while waiting, waits for the newer one
    /// instead.
    pub async fn wait_for_build(&self) -> Result<()> {
        loop {
            let pending = self.state.lock().pending.subscribe();
            match pending.wait().await {
                Err(e) if e.is_interrupted() => continue,
                other => return other,
            }
        }
    }

    /// Snapshot of the artifacts being served.
    pub fn artifacts(&self) -> Arc<ArtifactMap> {
        Arc::clone(&self.artifacts.read())
    }

    pub fn status(&self) -> BuildStatus {
        self.state.lock().status.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Files whose changes trigger a rebuild.
    pub fn watched(&self) -> WatchSet {
        self.watches.watched()
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    async fn handle_triggers(self: Arc<Self>, batch: Vec<Option<PathBuf>>) {
        let mut changed: Vec<PathBuf> = batch.into_iter().flatten().collect();
        changed.sort();
        changed.dedup();

        if !changed.is_empty() {
            tracing::debug!("{} files changed", changed.len());
            self.observer.on_change(&changed).await;
        }
        self.start_build();
    }

    async fn run(&self, generation: u64) {
        self.observer.on_before_rebuild(generation).await;

        if let Some(source) = &self.options.entry_source {
            self.sources.prime_source(&self.options.entry, source);
        }

        let request = CompileRequest {
            entry: self.options.entry.clone(),
            entry_source: self.options.entry_source.clone(),
            bundle: true,
            source_maps: self.options.source_maps,
            output_name: self.options.output_name.clone(),
        };

        tracing::info!("Building {} (generation {})", self.options.entry.display(), generation);
        let started = Instant::now();
        let result = self.compiler.compile(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = match result {
            Ok(output) if output.outputs.is_empty() => {
                self.fail(generation, BuildError::NoOutput).await;
                return;
            }
            Ok(output) => output,
            Err(failure) => {
                self.fail(generation, BuildError::Compile(failure)).await;
                return;
            }
        };

        let mut map = ArtifactMap::from_outputs(output.outputs, now_ms());
        map.ensure(&self.options.css_path(), now_ms());

        let pending = {
            let mut state = self.state.lock();
            if state.generation != generation {
                tracing::debug!(
                    "discarding build {} (current is {})",
                    generation,
                    state.generation
                );
                return;
            }
            *self.artifacts.write() = Arc::new(map);
            state.status = BuildStatus::Applied {
                generation,
                duration_ms,
            };
            state.pending.clone()
        };

        match self.watches.replace(WatchSet::from_inputs(&output.inputs)) {
            Ok(dirs) => tracing::debug!("watching {} inputs in {} directories", output.inputs.len(), dirs),
            Err(e) => tracing::warn!("{}", e),
        }

        tracing::info!("Build {} completed in {}ms", generation, duration_ms);
        pending.resolve(());
        self.observer.on_applied(generation).await;
    }

    async fn fail(&self, generation: u64, error: BuildError) {
        let pending = {
            let mut state = self.state.lock();
            if state.generation != generation {
                tracing::debug!("ignoring failure of superseded build {}", generation);
                return;
            }
            state.status = BuildStatus::Failed {
                generation,
                message: error.to_string(),
            };
            state.pending.clone()
        };

        // nothing watched yet: at least follow the entry so a fix is picked up
        if self.watches.watched().is_empty() {
            if let Err(e) = self
                .watches
                .replace(WatchSet::from_inputs([&self.options.entry]))
            {
                tracing::warn!("{}", e);
            }
        }

        tracing::error!("Build {} failed: {}", generation, error);
        let failure = error.to_failure();
        pending.reject(error);
        self.observer.on_failed(&failure).await;
    }
}
