//! Dependency graph walking.
//!
//! [`Analyzer::analyze`] walks breadth-first from an entry, yielding each
//! reachable file as it is processed. Every call re-walks the graph; the
//! shared [`DependencyCache`] keeps unchanged files from being read again.

pub mod parser;
pub mod rewrite;

pub use parser::{scan_imports, ImportKind, ScannedImport};
pub use rewrite::rewrite_specifiers;

use async_stream::try_stream;
use futures::{Stream, TryStreamExt};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{AnalyzeOptions, MAX_FILE_SIZE};
use crate::paths::{fs_url, relative_specifier};
use crate::record::{DependencyCache, DependencyRecord, ImportEntry};
use crate::resolver::{ModuleResolver, Resolution};
use crate::runtime::{Runtime, RuntimeError, StatSignature};
use crate::wrap::{module_source, SourceKind};

/// Errors raised while analyzing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalyzeError {
    #[error("entry not found: {}", .0.display())]
    EntryNotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: RuntimeError,
    },

    #[error("{} is {size} bytes, over the {max} byte limit", path.display())]
    FileTooLarge { path: PathBuf, size: u64, max: u64 },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, AnalyzeError>;

/// Walks import graphs, rewriting specifiers for unbundled serving.
#[derive(Debug, Clone)]
pub struct Analyzer {
    resolver: ModuleResolver,
    records: Arc<DependencyCache>,
}

impl Analyzer {
    pub fn new(runtime: Arc<dyn Runtime>, records: Arc<DependencyCache>) -> Self {
        Self {
            resolver: ModuleResolver::new(runtime),
            records,
        }
    }

    pub fn records(&self) -> &Arc<DependencyCache> {
        &self.records
    }

    fn runtime(&self) -> &dyn Runtime {
        self.resolver.runtime().as_ref()
    }

    /// Lazily walk the graph from `entry`, yielding each reachable path once.
    ///
    /// Local, aliased and external imports are followed; unresolved ones are
    /// left for the browser to report.
    pub fn analyze<'a>(
        &'a self,
        entry: &'a Path,
        options: &'a AnalyzeOptions,
    ) -> impl Stream<Item = Result<PathBuf>> + Send + 'a {
        try_stream! {
            if options.entry_source.is_none() && !self.runtime().exists(entry) {
                Err::<(), _>(AnalyzeError::EntryNotFound(entry.to_path_buf()))?;
            }

            let mut visited = FxHashSet::default();
            let mut queue = VecDeque::from([entry.to_path_buf()]);

            while let Some(path) = queue.pop_front() {
                if !visited.insert(path.clone()) {
                    continue;
                }

                let supplied = if path == entry {
                    options.entry_source.clone()
                } else {
                    None
                };
                let record = self.analyze_file(&path, supplied, options).await?;

                for dep in record.dependencies() {
                    if !visited.contains(dep) {
                        queue.push_back(dep.to_path_buf());
                    }
                }

                yield path;
            }
        }
    }

    /// Collect the whole walk.
    pub async fn analyze_all(&self, entry: &Path, options: &AnalyzeOptions) -> Result<Vec<PathBuf>> {
        self.analyze(entry, options).try_collect().await
    }

    /// Analyze one file and update its record.
    ///
    /// With `supplied` source the file is always reprocessed; otherwise an
    /// existing record whose signature still matches is returned untouched.
    pub async fn analyze_file(
        &self,
        path: &Path,
        supplied: Option<String>,
        options: &AnalyzeOptions,
    ) -> Result<DependencyRecord> {
        let signature = self.signature(path, supplied.is_some()).await?;

        let text = match supplied {
            Some(text) => text,
            None => {
                if let Some(sig) = signature {
                    if let Some(record) = self.records.fresh(path, sig) {
                        tracing::trace!("reusing record for {}", path.display());
                        return Ok(record);
                    }
                }
                self.read(path).await?
            }
        };

        let kind = SourceKind::from_path(path);
        if kind != SourceKind::Script {
            return Ok(self
                .records
                .update(path, signature, module_source(kind, &text), Vec::new()));
        }

        let importer_dir = path.parent().unwrap_or(Path::new("/"));
        let mut imports = Vec::new();
        let mut replacements = FxHashMap::default();

        for scanned in scan_imports(&text) {
            let resolution = self
                .resolver
                .resolve(
                    &scanned.specifier,
                    importer_dir,
                    &options.aliases,
                    options.external_resolution,
                )
                .await?;

            let rewritten = match &resolution {
                Resolution::Local(target) => Some(relative_specifier(importer_dir, target)),
                Resolution::Alias(target) | Resolution::External(target) => {
                    let url = fs_url(&options.fs_root, target);
                    if let Some(url) = &url {
                        self.records.register_import(&scanned.specifier, url);
                    }
                    url
                }
                Resolution::Unresolved => {
                    tracing::debug!(
                        "passing through unresolved '{}' in {}",
                        scanned.specifier,
                        path.display()
                    );
                    None
                }
            };

            if let Some(to) = rewritten.filter(|to| *to != scanned.specifier) {
                replacements.insert(scanned.specifier.clone(), to);
            }
            imports.push(ImportEntry {
                specifier: scanned.specifier,
                resolution,
            });
        }

        let source = rewrite_specifiers(&text, &replacements);
        Ok(self.records.update(path, signature, source, imports))
    }

    async fn signature(&self, path: &Path, supplied: bool) -> Result<Option<StatSignature>> {
        match self.runtime().metadata(path).await {
            Ok(meta) => {
                if meta.size > MAX_FILE_SIZE {
                    return Err(AnalyzeError::FileTooLarge {
                        path: path.to_path_buf(),
                        size: meta.size,
                        max: MAX_FILE_SIZE,
                    });
                }
                Ok(Some(meta.signature()))
            }
            Err(e) if e.is_not_found() && supplied => Ok(None),
            Err(e) => Err(AnalyzeError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    async fn read(&self, path: &Path) -> Result<String> {
        self.runtime()
            .read_to_string(path)
            .await
            .map_err(|source| AnalyzeError::Read {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_utils::MemoryRuntime;
    use futures::StreamExt;

    fn setup() -> (Arc<MemoryRuntime>, Analyzer) {
        let rt = Arc::new(MemoryRuntime::new());
        let analyzer = Analyzer::new(rt.clone(), Arc::new(DependencyCache::new()));
        (rt, analyzer)
    }

    #[tokio::test]
    async fn walks_breadth_first_and_rewrites_relative_imports() {
        let (rt, analyzer) = setup();
        rt.write("/p/src/index.ts", "import { u } from './util';\nimport './lib';\n");
        rt.write("/p/src/util.ts", "export const u = 1;\n");
        rt.write("/p/src/lib/index.js", "import '../util.ts';\n");

        let options = AnalyzeOptions::new("/p");
        let paths = analyzer
            .analyze_all(Path::new("/p/src/index.ts"), &options)
            .await
            .unwrap();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/p/src/index.ts"),
                PathBuf::from("/p/src/util.ts"),
                PathBuf::from("/p/src/lib/index.js"),
            ]
        );

        let entry = analyzer.records().get(Path::new("/p/src/index.ts")).unwrap();
        assert_eq!(
            entry.source,
            "import { u } from './util.ts';\nimport './lib/index.js';\n"
        );
    }

    #[tokio::test]
    async fn stream_is_lazy_and_restartable() {
        let (rt, analyzer) = setup();
        rt.write("/p/a.ts", "import './b'");
        rt.write("/p/b.ts", "");
        let options = AnalyzeOptions::new("/p");

        let mut stream = Box::pin(analyzer.analyze(Path::new("/p/a.ts"), &options));
        assert_eq!(stream.next().await.unwrap().unwrap(), PathBuf::from("/p/a.ts"));
        assert_eq!(analyzer.records().len(), 1);
        drop(stream);

        let again = analyzer.analyze_all(Path::new("/p/a.ts"), &options).await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn unchanged_files_are_not_read_again() {
        let (rt, analyzer) = setup();
        rt.write("/p/a.ts", "import './b'");
        rt.write("/p/b.ts", "");
        let options = AnalyzeOptions::new("/p");

        analyzer.analyze_all(Path::new("/p/a.ts"), &options).await.unwrap();
        let reads = rt.reads();
        analyzer.analyze_all(Path::new("/p/a.ts"), &options).await.unwrap();
        assert_eq!(rt.reads(), reads);

        rt.write("/p/b.ts", "export {}");
        analyzer.analyze_all(Path::new("/p/a.ts"), &options).await.unwrap();
        assert_eq!(rt.reads(), reads + 1);
    }

    #[tokio::test]
    async fn entry_source_is_always_reparsed() {
        let (rt, analyzer) = setup();
        rt.write("/p/b.ts", "");
        rt.write("/p/c.ts", "");
        let entry = Path::new("/p/virtual.ts");

        let first = AnalyzeOptions::new("/p").with_entry_source("import './b'");
        analyzer.analyze_all(entry, &first).await.unwrap();
        let second = AnalyzeOptions::new("/p").with_entry_source("import './c'");
        let paths = analyzer.analyze_all(entry, &second).await.unwrap();

        assert_eq!(paths, vec![entry.to_path_buf(), PathBuf::from("/p/c.ts")]);
        assert_eq!(analyzer.records().get(entry).unwrap().source, "import './c.ts'");
    }

    #[tokio::test]
    async fn aliases_go_to_the_import_map() {
        let (rt, analyzer) = setup();
        rt.write("/p/a.ts", "import React from 'react';");
        rt.write("/p/vendor/react.js", "");
        let mut aliases = crate::resolver::AliasTable::new();
        aliases.insert("react".into(), PathBuf::from("/p/vendor/react.js"));
        let options = AnalyzeOptions::new("/p").with_aliases(aliases);

        let paths = analyzer.analyze_all(Path::new("/p/a.ts"), &options).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(
            analyzer.records().get(Path::new("/p/a.ts")).unwrap().source,
            "import React from '/@fs/vendor/react.js';"
        );
        assert_eq!(
            analyzer.records().import_map().imports.get("react").map(String::as_str),
            Some("/@fs/vendor/react.js")
        );
    }

    #[tokio::test]
    async fn css_and_json_are_wrapped_without_scanning() {
        let (rt, analyzer) = setup();
        rt.write("/p/a.ts", "import './s.css'; import data from './d.json';");
        rt.write("/p/s.css", "@import './other.css';");
        rt.write("/p/d.json", "{\"k\": true}");
        let options = AnalyzeOptions::new("/p");

        let paths = analyzer.analyze_all(Path::new("/p/a.ts"), &options).await.unwrap();
        assert_eq!(paths.len(), 3);

        let css = analyzer.records().get(Path::new("/p/s.css")).unwrap();
        assert!(css.source.contains("document.head.appendChild(style)"));
        assert!(css.imports.is_empty());
        let json = analyzer.records().get(Path::new("/p/d.json")).unwrap();
        assert_eq!(json.source, "export default {\"k\": true};\n");
    }

    #[tokio::test]
    async fn missing_entry_is_an_error() {
        let (_rt, analyzer) = setup();
        let err = analyzer
            .analyze_all(Path::new("/p/nope.ts"), &AnalyzeOptions::new("/p"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::EntryNotFound(_)));
    }
}
