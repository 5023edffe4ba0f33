//! Extension, index and package-main fallbacks for relative specifiers.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::runtime::{node, Runtime, RuntimeResult};

/// Suffixes tried in order when resolving a relative specifier.
///
/// The empty suffix comes first so specifiers that already carry an
/// extension (or name a directory) win.
pub const EXTENSIONS: &[&str] = &[
    "", ".ts", ".mjs", ".js", ".tsx", ".jsx", ".json", ".mts", ".mtsx", ".mjsx",
];

/// Append a suffix to a path without replacing an existing extension.
///
/// `with_extension` would turn `./foo.config` into `./foo.ts`; appending
/// keeps it `./foo.config.ts`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        return path.to_path_buf();
    }
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

async fn is_file(runtime: &dyn Runtime, path: &Path) -> bool {
    matches!(runtime.metadata(path).await, Ok(meta) if meta.is_file)
}

/// Try `dir/index.*` in extension order.
pub async fn try_index_files(
    runtime: &dyn Runtime,
    dir: &Path,
) -> RuntimeResult<Option<PathBuf>> {
    for ext in EXTENSIONS {
        let index = dir.join(format!("index{ext}"));
        if is_file(runtime, &index).await {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Try a directory's `package.json` `module`/`main` entry.
pub async fn try_package_main(
    runtime: &dyn Runtime,
    dir: &Path,
) -> RuntimeResult<Option<PathBuf>> {
    let Some(manifest) = node::read_manifest(runtime, dir).await else {
        return Ok(None);
    };
    let main = ["module", "main"]
        .iter()
        .find_map(|field| manifest.get(*field).and_then(|v| v.as_str()));
    if let Some(main) = main {
        let candidate = path_clean::clean(dir.join(main));
        if is_file(runtime, &candidate).await {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Resolve a joined relative path: suffixes first, then for a directory its
/// `index.*`, then its package main.
pub async fn resolve_with_extensions(
    runtime: &dyn Runtime,
    joined: &Path,
) -> RuntimeResult<Option<PathBuf>> {
    for ext in EXTENSIONS {
        let candidate = with_suffix(joined, ext);
        let Ok(meta) = runtime.metadata(&candidate).await else {
            continue;
        };
        if meta.is_file {
            return Ok(Some(candidate));
        }
        if meta.is_dir {
            if let Some(index) = try_index_files(runtime, &candidate).await? {
                return Ok(Some(index));
            }
            if let Some(main) = try_package_main(runtime, &candidate).await? {
                return Ok(Some(main));
            }
        }
    }
    Ok(None)
}

/// File-or-index lookup used for package entries.
pub async fn try_file_or_index(
    runtime: &dyn Runtime,
    candidate: &Path,
) -> RuntimeResult<Option<PathBuf>> {
    for ext in EXTENSIONS {
        let with_ext = with_suffix(candidate, ext);
        if is_file(runtime, &with_ext).await {
            return Ok(Some(with_ext));
        }
    }
    try_index_files(runtime, candidate).await
}
