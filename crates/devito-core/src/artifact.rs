//! Compiled outputs and the map they are served from.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use devito_cache::StatSignature;

/// Size and timestamp used for HTTP validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactMeta {
    pub size: u64,
    pub modified_ms: u64,
}

impl ArtifactMeta {
    /// Entity tag in the same `"<size hex>-<mtime hex>"` form as source files.
    pub fn etag(&self) -> String {
        StatSignature::new(self.modified_ms, self.size).etag()
    }
}

/// One servable output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub contents: Arc<[u8]>,
    pub content_type: &'static str,
    pub meta: ArtifactMeta,
}

impl Artifact {
    pub fn new(path: &str, contents: impl Into<Arc<[u8]>>, modified_ms: u64) -> Self {
        let contents = contents.into();
        Self {
            meta: ArtifactMeta {
                size: contents.len() as u64,
                modified_ms,
            },
            content_type: content_type_for(path),
            contents,
        }
    }

    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = content_type;
        self
    }
}

/// Output path (`/bundle.js`, `/bundle.css`, ...) to artifact.
///
/// Replaced wholesale after each successful build, never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactMap {
    artifacts: BTreeMap<String, Artifact>,
}

impl ArtifactMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from compiler outputs, all stamped with `modified_ms`.
    ///
    /// Output paths are made absolute (`bundle.js` becomes `/bundle.js`)
    /// and each artifact's content type is taken from its extension.
    pub fn from_outputs(outputs: BTreeMap<String, Vec<u8>>, modified_ms: u64) -> Self {
        let artifacts = outputs
            .into_iter()
            .map(|(path, bytes)| {
                let path = normalize_output_path(&path);
                let artifact = Artifact::new(&path, bytes, modified_ms);
                (path, artifact)
            })
            .collect();
        Self { artifacts }
    }

    /// Make sure `path` exists, inserting an empty artifact if it does not.
    pub fn ensure(&mut self, path: &str, modified_ms: u64) {
        self.artifacts
            .entry(path.to_string())
            .or_insert_with(|| Artifact::new(path, Vec::new(), modified_ms));
    }

    pub fn insert(&mut self, path: impl Into<String>, artifact: Artifact) {
        self.artifacts.insert(path.into(), artifact);
    }

    pub fn get(&self, path: &str) -> Option<&Artifact> {
        self.artifacts.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

fn normalize_output_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

pub const JAVASCRIPT: &str = "application/javascript; charset=utf-8";

/// MIME type by file extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default();
    match ext {
        "js" | "mjs" | "ts" | "tsx" | "jsx" | "mts" | "mtsx" | "mjsx" => JAVASCRIPT,
        "css" => "text/css; charset=utf-8",
        "map" | "json" => "application/json; charset=utf-8",
        "html" => "text/html; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "wasm" => "application/wasm",
        "woff2" => "font/woff2",
        "woff" => "font/woff",
        _ => "application/octet-stream",
    }
}

/// Milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_js() {
        assert_eq!(content_type_for("/bundle.js"), "application/javascript; charset=utf-8");
        assert_eq!(content_type_for("/a.mjs"), "application/javascript; charset=utf-8");
    }

    #[test]
    fn test_content_type_map() {
        assert_eq!(content_type_for("/bundle.js.map"), "application/json; charset=utf-8");
    }

    #[test]
    fn test_content_type_unknown() {
        assert_eq!(content_type_for("/file.xyz"), "application/octet-stream");
    }

    #[test]
    fn outputs_are_rooted_and_sized() {
        let mut outputs = BTreeMap::new();
        outputs.insert("bundle.js".to_string(), b"console.log(1)".to_vec());
        let mut map = ArtifactMap::from_outputs(outputs, 0x10);
        map.ensure("/bundle.css", 0x10);

        let js = map.get("/bundle.js").unwrap();
        assert_eq!(js.meta.size, 14);
        assert_eq!(js.meta.etag(), "\"e-10\"");
        assert_eq!(map.get("/bundle.css").unwrap().meta.size, 0);
        assert_eq!(map.paths().collect::<Vec<_>>(), vec!["/bundle.css", "/bundle.js"]);
    }

    #[test]
    fn ensure_keeps_real_output() {
        let mut outputs = BTreeMap::new();
        outputs.insert("/bundle.css".to_string(), b"body{}".to_vec());
        let mut map = ArtifactMap::from_outputs(outputs, 1);
        map.ensure("/bundle.css", 2);
        assert_eq!(&*map.get("/bundle.css").unwrap().contents, b"body{}");
    }
}
