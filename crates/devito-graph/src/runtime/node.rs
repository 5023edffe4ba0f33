//! Node-style package resolution for bare specifiers.
//!
//! Walks `node_modules` directories upward from the importing directory and
//! picks the package entry from `package.json`: `exports` (string, `"."`, or
//! the `browser`/`import`/`module`/`default` conditions), then `module`, then
//! `main`, then `index.js`. The winning file is returned as its realpath.

use path_clean::PathClean;
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{Runtime, RuntimeResult};
use crate::resolver::extensions::try_file_or_index;

/// Export conditions honoured when reading `exports`, in priority order.
pub const EXPORT_CONDITIONS: &[&str] = &["browser", "import", "module", "default"];

/// Split `@scope/pkg/sub/path` into `("@scope/pkg", Some("sub/path"))`.
pub fn split_specifier(specifier: &str) -> Option<(&str, Option<&str>)> {
    if specifier.is_empty() || specifier.starts_with('.') || specifier.starts_with('/') {
        return None;
    }

    let name_end = if specifier.starts_with('@') {
        let scope_end = specifier.find('/')?;
        specifier[scope_end + 1..]
            .find('/')
            .map(|i| scope_end + 1 + i)
    } else {
        specifier.find('/')
    };

    match name_end {
        Some(end) => {
            let sub = &specifier[end + 1..];
            Some((&specifier[..end], (!sub.is_empty()).then_some(sub)))
        }
        None => Some((specifier, None)),
    }
}

/// Pick a target out of an `exports` value.
fn pick_export(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => {
            if let Some(dot) = map.get(".") {
                return pick_export(dot);
            }
            EXPORT_CONDITIONS
                .iter()
                .find_map(|cond| map.get(*cond).and_then(pick_export))
        }
        Value::Array(items) => items.iter().find_map(pick_export),
        _ => None,
    }
}

/// Entry of a package directory according to its manifest.
pub fn manifest_entry(manifest: &Value, subpath: Option<&str>) -> Option<String> {
    if let Some(sub) = subpath {
        let exported = manifest
            .get("exports")
            .and_then(|exports| exports.get(format!("./{sub}")))
            .and_then(pick_export);
        return Some(exported.unwrap_or(sub).to_string());
    }

    if let Some(target) = manifest.get("exports").and_then(pick_export) {
        return Some(target.to_string());
    }

    ["module", "main"]
        .iter()
        .find_map(|field| manifest.get(*field).and_then(Value::as_str))
        .map(str::to_string)
}

/// Read and parse a `package.json`, returning `None` when absent or malformed.
pub async fn read_manifest(runtime: &dyn Runtime, dir: &Path) -> Option<Value> {
    let manifest = dir.join("package.json");
    if !runtime.exists(&manifest) {
        return None;
    }
    let text = runtime.read_to_string(&manifest).await.ok()?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("ignoring malformed {}: {}", manifest.display(), e);
            None
        }
    }
}

/// Resolve a bare specifier to the realpath of the file it names.
pub async fn resolve_package(
    runtime: &dyn Runtime,
    specifier: &str,
    from_dir: &Path,
) -> RuntimeResult<Option<PathBuf>> {
    let Some((name, subpath)) = split_specifier(specifier) else {
        return Ok(None);
    };

    for dir in from_dir.ancestors() {
        let pkg_dir = dir.join("node_modules").join(name);
        if !runtime.exists(&pkg_dir) {
            continue;
        }

        let target = match read_manifest(runtime, &pkg_dir).await {
            Some(manifest) => manifest_entry(&manifest, subpath),
            None => subpath.map(str::to_string),
        }
        .unwrap_or_else(|| "index.js".to_string());

        let candidate = pkg_dir.join(target).clean();
        if let Some(found) = try_file_or_index(runtime, &candidate).await? {
            return runtime.canonicalize(&found).await.map(Some);
        }
    }

    Ok(None)
}
