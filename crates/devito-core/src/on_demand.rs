//! Unbundled, per-file serving.
//!
//! Each file requested under `/@fs/` is compiled on its own: its source is
//! read through the `source` cache, `import.meta.url` is pointed at the
//! file's URL, imports are rewritten by the analyzer, and the result is
//! transpiled with `bundle = false`. Artifacts are cached per file under the
//! `unbundled` variant, so concurrent requests for the same file share one
//! compile.
//!
//! JSX files naming a runtime through `/** @jsxImportSource pkg */` get the
//! pragma pointed at the package's `/@fs/` directory; the compiler then emits
//! an extensionless `.../pkg/jsx-runtime` import, which [`OnDemandBuilder::discover`]
//! maps back to a file.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use devito_cache::{CacheKey, CacheManager, Cached, DerivedSources, ResourceCache, StatSignature};
use devito_graph::resolver::resolve_with_extensions;
use devito_graph::{fs_url, AnalyzeOptions, Analyzer, DependencyCache, ImportMap, Runtime, SourceKind};

use crate::artifact::{Artifact, JAVASCRIPT};
use crate::bus::{BusMessage, ChangeBus};
use crate::compiler::{CompileRequest, Compiler};
use crate::debounce::Debouncer;
use crate::error::{BuildError, Result};
use crate::watch::{ChangeSink, FileWatcher, WatchRegistry, WatchSet};

const UNBUNDLED: &str = "unbundled";

const JSX_PRAGMA: &str = "/** @jsxImportSource ";

/// Compiles and caches single-file artifacts.
pub struct OnDemandBuilder {
    runtime: Arc<dyn Runtime>,
    options: RwLock<AnalyzeOptions>,
    analyzer: Analyzer,
    sources: DerivedSources,
    compiler: Arc<dyn Compiler>,
    caches: Arc<CacheManager>,
    artifacts: Arc<ResourceCache<Artifact, BuildError>>,
    // input file -> artifacts compiled from it
    dependents: Mutex<FxHashMap<PathBuf, BTreeSet<PathBuf>>>,
    bus: ChangeBus,
    changes: Debouncer<PathBuf>,
    watches: WatchRegistry,
}

impl std::fmt::Debug for OnDemandBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDemandBuilder")
            .field("artifacts", &self.artifacts.len())
            .field("tracked", &self.dependents.lock().len())
            .finish_non_exhaustive()
    }
}

impl OnDemandBuilder {
    /// Create a builder. Must be called inside a tokio runtime.
    ///
    /// The artifact cache is registered with `caches`, so a global
    /// `forget`/`clear_all` reaches it too.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn Runtime>,
        options: AnalyzeOptions,
        compiler: Arc<dyn Compiler>,
        sources: DerivedSources,
        caches: Arc<CacheManager>,
        watcher: Arc<dyn FileWatcher>,
        bus: ChangeBus,
        debounce: Duration,
    ) -> Arc<Self> {
        let artifacts = caches.create::<Artifact, BuildError>(UNBUNDLED, runtime.clone());
        let analyzer = Analyzer::new(runtime.clone(), Arc::new(DependencyCache::new()));

        Arc::new_cyclic(|this: &Weak<Self>| {
            let on_batch = this.clone();
            let changes = Debouncer::new(debounce, move |batch: Vec<PathBuf>| {
                let this = on_batch.clone();
                async move {
                    if let Some(this) = this.upgrade() {
                        this.invalidate(&batch).await;
                    }
                }
            });

            let on_change = this.clone();
            let sink: ChangeSink = Arc::new(move |change| {
                if let Some(this) = on_change.upgrade() {
                    this.changes.schedule(change.into_path());
                }
            });

            Self {
                runtime,
                options: RwLock::new(options),
                analyzer,
                sources,
                compiler,
                caches,
                artifacts,
                dependents: Mutex::new(FxHashMap::default()),
                bus,
                changes,
                watches: WatchRegistry::new(watcher, sink),
            }
        })
    }

    /// The compiled artifact for `path`, reused while the file's signature
    /// is unchanged.
    pub async fn artifact(self: &Arc<Self>, path: &Path) -> Result<Cached<Artifact>> {
        let this = Arc::clone(self);
        self.artifacts
            .get_or_create(
                CacheKey::new(path).with_variant(UNBUNDLED),
                move |key, signature| this.compile(key.path, signature),
            )
            .await
    }

    async fn compile(self: Arc<Self>, path: PathBuf, signature: StatSignature) -> Result<Artifact> {
        let source = self.sources.with_import_meta_url(&path).await?;
        let mut text = source.payload.to_string();
        if is_jsx(&path) {
            text = self.rewrite_jsx_import_source(&path, text);
        }
        let options = self.options.read().clone();
        let record = self.analyzer.analyze_file(&path, Some(text), &options).await?;

        let (contents, inputs) = match SourceKind::from_path(&path) {
            // wrapped modules are already plain JavaScript
            SourceKind::Css | SourceKind::Json => (record.source.into_bytes(), Vec::new()),
            SourceKind::Script => {
                let output = self
                    .compiler
                    .compile(CompileRequest::transform(&path, record.source))
                    .await?;
                let js = output.primary_js().ok_or(BuildError::NoOutput)?.to_vec();
                (js, output.inputs)
            }
        };

        self.track(&path, inputs);
        tracing::debug!("compiled {} ({} bytes)", path.display(), contents.len());
        Ok(Artifact::new(&path.to_string_lossy(), contents, signature.modified_ms)
            .with_content_type(JAVASCRIPT))
    }

    /// Point each `@jsxImportSource` pragma at the package directory found
    /// in `node_modules` above `path`. Unknown packages are left as written.
    fn rewrite_jsx_import_source(&self, path: &Path, mut source: String) -> String {
        let fs_root = self.fs_root();
        let from_dir = path.parent().unwrap_or(Path::new("/"));
        for id in jsx_import_sources(&source) {
            let package = from_dir
                .ancestors()
                .map(|dir| dir.join("node_modules").join(&id))
                .find(|dir| self.runtime.exists(dir));
            if let Some(url) = package.and_then(|dir| fs_url(&fs_root, &dir)) {
                source = source.replace(&format!("{JSX_PRAGMA}{id}"), &format!("{JSX_PRAGMA}{url}"));
            }
        }
        source
    }

    /// File behind an extensionless request such as `.../preact/jsx-runtime`:
    /// the path with a known suffix, else the directory's `index.*` or
    /// package main.
    pub async fn discover(&self, path: &Path) -> Result<Option<PathBuf>> {
        Ok(resolve_with_extensions(self.runtime.as_ref(), path).await?)
    }

    /// Record that `artifact` was built from `inputs` (and itself) and make
    /// sure all of them are watched.
    fn track(&self, artifact: &Path, inputs: Vec<PathBuf>) {
        let watched = {
            let mut dependents = self.dependents.lock();
            let before = dependents.len();
            for input in inputs.into_iter().chain([artifact.to_path_buf()]) {
                dependents
                    .entry(input)
                    .or_default()
                    .insert(artifact.to_path_buf());
            }
            (dependents.len() != before).then(|| WatchSet::from_inputs(dependents.keys()))
        };

        if let Some(set) = watched {
            if let Err(e) = self.watches.replace(set) {
                tracing::warn!("{}", e);
            }
        }
    }

    /// Evict `changed` files, the artifacts built from them and the files
    /// importing them, then tell clients which URLs changed.
    ///
    /// Returns the announced URLs.
    pub async fn invalidate(&self, changed: &[PathBuf]) -> Vec<String> {
        let mut affected = BTreeSet::new();
        {
            let mut dependents = self.dependents.lock();
            for path in changed {
                affected.insert(path.clone());
                if let Some(artifacts) = dependents.remove(path) {
                    affected.extend(artifacts);
                }
                affected.extend(self.analyzer.records().importers_of(path));
            }
        }

        let mut evicted = 0;
        for path in &affected {
            evicted += self.caches.forget(path);
            self.analyzer.records().remove(path);
        }

        let fs_root = self.options.read().fs_root.clone();
        let urls: Vec<String> = affected
            .iter()
            .filter_map(|path| fs_url(&fs_root, path))
            .collect();

        tracing::debug!(
            "invalidated {} files ({} cache entries)",
            affected.len(),
            evicted
        );
        if !urls.is_empty() {
            self.bus.broadcast(&BusMessage::update(urls.iter().cloned())).await;
        }
        urls
    }

    /// The browser could not load `specifier` imported by `importer`.
    ///
    /// Resolves it as an external package, adds it to the alias table and
    /// invalidates the importer so the next request picks up the rewrite.
    /// Returns the resolved path, or `None` if the package does not exist.
    pub async fn report_missing(&self, specifier: &str, importer: &Path) -> Result<Option<PathBuf>> {
        let from_dir = importer.parent().unwrap_or(Path::new("/"));
        let Some(resolved) = self.runtime.resolve_external(specifier, from_dir).await? else {
            tracing::warn!(
                "'{}' imported by {} is not installed",
                specifier,
                importer.display()
            );
            return Ok(None);
        };

        tracing::info!("aliasing '{}' to {}", specifier, resolved.display());
        self.options
            .write()
            .aliases
            .insert(specifier.to_string(), resolved.clone());
        self.invalidate(&[importer.to_path_buf()]).await;
        Ok(Some(resolved))
    }

    /// Walk the graph from `entry` so its bare imports show up in the import
    /// map before any file is requested. Returns the number of files visited.
    pub async fn analyze(&self, entry: &Path) -> Result<usize> {
        let options = self.options.read().clone();
        let visited = self.analyzer.analyze_all(entry, &options).await?;
        Ok(visited.len())
    }

    /// Aliases and resolved bare imports, as browser URLs.
    pub fn import_map(&self) -> ImportMap {
        let mut map = self.analyzer.records().import_map();
        let options = self.options.read();
        for (specifier, target) in &options.aliases {
            if let Some(url) = fs_url(&options.fs_root, target) {
                map.imports.entry(specifier.clone()).or_insert(url);
            }
        }
        map
    }

    /// Drop every artifact and analysis record.
    pub fn clear(&self) {
        self.artifacts.clear();
        self.analyzer.records().clear();
        self.dependents.lock().clear();
        self.watches.clear();
    }

    pub fn fs_root(&self) -> PathBuf {
        self.options.read().fs_root.clone()
    }

    /// Files whose changes invalidate artifacts.
    pub fn watched(&self) -> WatchSet {
        self.watches.watched()
    }
}

fn is_jsx(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.ends_with('x'))
}

/// Package names from `/** @jsxImportSource <id>` pragmas, already
/// rewritten (absolute) ones skipped.
fn jsx_import_sources(source: &str) -> BTreeSet<String> {
    source
        .match_indices(JSX_PRAGMA)
        .filter_map(|(at, _)| source[at + JSX_PRAGMA.len()..].split_whitespace().next())
        .filter(|id| !id.starts_with('/'))
        .map(str::to_string)
        .collect()
}
