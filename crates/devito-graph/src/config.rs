//! Options for a dependency analysis pass.

use std::path::PathBuf;

use crate::resolver::AliasTable;

/// Largest source file the analyzer will read (10 MiB).
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Options for [`Analyzer::analyze`](crate::Analyzer::analyze).
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// In-memory source for the entry; when set the entry is always reparsed.
    pub entry_source: Option<String>,
    /// Resolve bare specifiers through `node_modules`.
    pub external_resolution: bool,
    /// Exact-match specifier aliases.
    pub aliases: AliasTable,
    /// Root under which files are exposed as `/@fs/...`.
    pub fs_root: PathBuf,
}

impl AnalyzeOptions {
    pub fn new(fs_root: impl Into<PathBuf>) -> Self {
        Self {
            fs_root: fs_root.into(),
            ..Self::default()
        }
    }

    pub fn with_entry_source(mut self, source: impl Into<String>) -> Self {
        self.entry_source = Some(source.into());
        self
    }

    pub fn with_external_resolution(mut self, enabled: bool) -> Self {
        self.external_resolution = enabled;
        self
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }
}
