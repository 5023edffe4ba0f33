//! Module resolution for unbundled serving.
//!
//! Resolution order:
//! 1. alias table exact match
//! 2. relative specifiers against the importing file's directory, with
//!    extension, `index.*` and `package.json` fallbacks
//! 3. bare specifiers through external package resolution, when enabled
//!
//! Anything else is [`Resolution::Unresolved`] and is passed through to the
//! browser untouched.

pub mod aliases;
pub mod extensions;

pub use aliases::{resolve_alias, AliasTable};
pub use extensions::{resolve_with_extensions, with_suffix, EXTENSIONS};

use path_clean::PathClean;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::runtime::{Runtime, RuntimeResult};

/// Outcome of resolving one specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Matched the alias table.
    Alias(PathBuf),
    /// Relative specifier resolved on disk.
    Local(PathBuf),
    /// Bare specifier resolved to a package file (realpath).
    External(PathBuf),
    /// Could not be resolved; the specifier stays as written.
    Unresolved,
}

impl Resolution {
    /// Absolute path this resolution points at, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::Alias(p) | Resolution::Local(p) | Resolution::External(p) => Some(p),
            Resolution::Unresolved => None,
        }
    }
}

/// Whether a specifier is relative to the importing file.
pub fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier == "." || specifier == ".."
}

/// Module resolver bound to a runtime.
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    runtime: Arc<dyn Runtime>,
}

impl ModuleResolver {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Resolve `specifier` as imported from a file living in `importer_dir`.
    pub async fn resolve(
        &self,
        specifier: &str,
        importer_dir: &Path,
        aliases: &AliasTable,
        external_resolution: bool,
    ) -> RuntimeResult<Resolution> {
        if let Some(target) = resolve_alias(specifier, aliases) {
            return Ok(Resolution::Alias(target.to_path_buf()));
        }

        if is_relative(specifier) {
            let joined = importer_dir.join(specifier).clean();
            return Ok(
                match resolve_with_extensions(self.runtime.as_ref(), &joined).await? {
                    Some(found) => Resolution::Local(found),
                    None => Resolution::Unresolved,
                },
            );
        }

        if external_resolution && !specifier.starts_with('/') && !specifier.contains(':') {
            if let Some(found) = self
                .runtime
                .resolve_external(specifier, importer_dir)
                .await?
            {
                return Ok(Resolution::External(found));
            }
        }

        Ok(Resolution::Unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_utils::MemoryRuntime;

    fn resolver(rt: MemoryRuntime) -> ModuleResolver {
        ModuleResolver::new(Arc::new(rt))
    }

    #[tokio::test]
    async fn test_resolve_relative() {
        let rt = MemoryRuntime::new();
        rt.write("/test/src/utils.ts", "");
        let resolver = resolver(rt);

        let result = resolver
            .resolve("./utils", Path::new("/test/src"), &AliasTable::new(), false)
            .await
            .unwrap();
        assert_eq!(result, Resolution::Local(PathBuf::from("/test/src/utils.ts")));

        let result = resolver
            .resolve("../src/utils.ts", Path::new("/test/src"), &AliasTable::new(), false)
            .await
            .unwrap();
        assert_eq!(result, Resolution::Local(PathBuf::from("/test/src/utils.ts")));
    }

    #[tokio::test]
    async fn alias_wins_over_everything() {
        let rt = MemoryRuntime::new();
        rt.write("/test/src/react.ts", "");
        let resolver = resolver(rt);
        let mut aliases = AliasTable::new();
        aliases.insert("./react".into(), PathBuf::from("/vendor/react.js"));

        let result = resolver
            .resolve("./react", Path::new("/test/src"), &aliases, true)
            .await
            .unwrap();
        assert_eq!(result, Resolution::Alias(PathBuf::from("/vendor/react.js")));
    }

    #[tokio::test]
    async fn bare_specifier_needs_external_resolution() {
        let rt = MemoryRuntime::new();
        rt.write("/test/node_modules/lodash/package.json", r#"{"main":"lodash.js"}"#);
        rt.write("/test/node_modules/lodash/lodash.js", "");
        let resolver = resolver(rt);

        let off = resolver
            .resolve("lodash", Path::new("/test/src"), &AliasTable::new(), false)
            .await
            .unwrap();
        assert_eq!(off, Resolution::Unresolved);

        let on = resolver
            .resolve("lodash", Path::new("/test/src"), &AliasTable::new(), true)
            .await
            .unwrap();
        assert_eq!(
            on,
            Resolution::External(PathBuf::from("/test/node_modules/lodash/lodash.js"))
        );
    }

    #[tokio::test]
    async fn unresolvable_relative_is_unresolved() {
        let resolver = resolver(MemoryRuntime::new());
        let result = resolver
            .resolve("./missing", Path::new("/test"), &AliasTable::new(), true)
            .await
            .unwrap();
        assert_eq!(result, Resolution::Unresolved);
        assert!(result.path().is_none());
    }
}
