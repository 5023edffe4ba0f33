//! Cache keys.

use std::fmt;
use std::path::{Path, PathBuf};

/// Identifies one cached artifact: a file plus an optional variant
/// discriminator such as `"bundled"` or `"unbundled"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub path: PathBuf,
    pub variant: Option<String>,
}

impl CacheKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            variant: None,
        }
    }

    /// Same file, separate entry.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<&Path> for CacheKey {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for CacheKey {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{} [{}]", self.path.display(), variant),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_are_distinct_keys() {
        let plain = CacheKey::new("/a.ts");
        let bundled = CacheKey::new("/a.ts").with_variant("bundled");
        assert_ne!(plain, bundled);
        assert_eq!(plain.path(), bundled.path());
        assert_eq!(bundled.to_string(), "/a.ts [bundled]");
    }
}
