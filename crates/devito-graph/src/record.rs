//! Dependency records shared across analysis passes.
//!
//! The cache is owned by whoever drives analysis and handed to every pass so
//! files whose stat signature did not change are not read or parsed again.
//! Records are updated in place; a record's path never changes.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::resolver::Resolution;
use crate::runtime::StatSignature;

/// One import as written in the source, and what it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub specifier: String,
    pub resolution: Resolution,
}

/// A file reachable from an entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRecord {
    pub path: PathBuf,
    /// Signature the source was read at; `None` for in-memory sources.
    pub signature: Option<StatSignature>,
    /// Browser-ready source with specifiers rewritten.
    pub source: String,
    pub imports: Vec<ImportEntry>,
}

impl DependencyRecord {
    /// Resolved paths of this file's imports, in source order.
    pub fn dependencies(&self) -> impl Iterator<Item = &Path> {
        self.imports.iter().filter_map(|i| i.resolution.path())
    }
}

/// Browser import map (`<script type="importmap">`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportMap {
    pub imports: BTreeMap<String, String>,
}

impl ImportMap {
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"imports\":{}}".to_string())
    }
}

/// Mutable record set plus the import map accumulated while analyzing.
#[derive(Debug, Default)]
pub struct DependencyCache {
    records: Mutex<FxHashMap<PathBuf, DependencyRecord>>,
    import_map: Mutex<ImportMap>,
}

impl DependencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<DependencyRecord> {
        self.records.lock().get(path).cloned()
    }

    /// Record reusable as-is when the file still has `signature`.
    pub fn fresh(&self, path: &Path, signature: StatSignature) -> Option<DependencyRecord> {
        self.records
            .lock()
            .get(path)
            .filter(|r| r.signature == Some(signature))
            .cloned()
    }

    /// Insert a record or update the existing one's contents in place.
    pub fn update(
        &self,
        path: &Path,
        signature: Option<StatSignature>,
        source: String,
        imports: Vec<ImportEntry>,
    ) -> DependencyRecord {
        let mut records = self.records.lock();
        let record = records
            .entry(path.to_path_buf())
            .or_insert_with(|| DependencyRecord {
                path: path.to_path_buf(),
                signature: None,
                source: String::new(),
                imports: Vec::new(),
            });
        record.signature = signature;
        record.source = source;
        record.imports = imports;
        record.clone()
    }

    pub fn remove(&self, path: &Path) -> Option<DependencyRecord> {
        self.records.lock().remove(path)
    }

    /// Every path with a record, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.records.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Files whose records import `path`.
    pub fn importers_of(&self, path: &Path) -> Vec<PathBuf> {
        let mut importers: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| r.dependencies().any(|d| d == path))
            .map(|r| r.path.clone())
            .collect();
        importers.sort();
        importers
    }

    pub fn register_import(&self, specifier: &str, url: &str) {
        self.import_map
            .lock()
            .imports
            .insert(specifier.to_string(), url.to_string());
    }

    pub fn import_map(&self) -> ImportMap {
        self.import_map.lock().clone()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
        self.import_map.lock().imports.clear();
    }
}
