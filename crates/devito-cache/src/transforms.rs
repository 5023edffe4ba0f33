//! Per-file derived sources, each cached in its own registered cache.

use devito_graph::wrap::rewrite_import_meta_url;
use devito_graph::{fs_url, Runtime};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::manager::CacheManager;
use crate::resource::{Cached, ResourceCache};

/// Shared source text.
pub type SourceText = Arc<str>;

const IMPORT_META_VARIANT: &str = "import-meta-url";

/// Raw file text and the `import.meta.url`-rewritten text.
#[derive(Debug, Clone)]
pub struct DerivedSources {
    runtime: Arc<dyn Runtime>,
    fs_root: PathBuf,
    source: Arc<ResourceCache<SourceText>>,
    import_meta: Arc<ResourceCache<SourceText>>,
}

impl DerivedSources {
    /// Create both caches and register them with `manager`.
    pub fn new(manager: &CacheManager, runtime: Arc<dyn Runtime>, fs_root: impl Into<PathBuf>) -> Self {
        Self {
            source: manager.create("source", runtime.clone()),
            import_meta: manager.create("import-meta-url", runtime.clone()),
            runtime,
            fs_root: fs_root.into(),
        }
    }

    pub fn source_cache(&self) -> &Arc<ResourceCache<SourceText>> {
        &self.source
    }

    /// File text, read at most once per stat signature.
    pub async fn source(&self, path: &Path) -> Result<Cached<SourceText>> {
        let runtime = self.runtime.clone();
        self.source
            .get_or_create(CacheKey::new(path), move |key, _| async move {
                let text = runtime.read_to_string(&key.path).await?;
                Ok::<_, CacheError>(SourceText::from(text))
            })
            .await
    }

    /// Serve `text` for `path` instead of the file on disk.
    pub fn prime_source(&self, path: &Path, text: &str) {
        self.source.prime(CacheKey::new(path), SourceText::from(text));
    }

    /// Source with `import.meta.url` pointing at the file's served URL.
    ///
    /// The rewrite is cached under the signature the source text was read
    /// at, never a fresh stat, so it always matches the text it came from.
    pub async fn with_import_meta_url(&self, path: &Path) -> Result<Cached<SourceText>> {
        let source = self.source(path).await?;
        if !source.payload.contains("import.meta.url") {
            return Ok(source);
        }

        let url = self.served_url(path);
        if self.source.is_pinned(&CacheKey::new(path)) {
            return Ok(Cached {
                signature: source.signature,
                payload: SourceText::from(rewrite_import_meta_url(&source.payload, &url)),
            });
        }

        let text = source.payload;
        self.import_meta
            .get_or_create_at(
                CacheKey::new(path).with_variant(IMPORT_META_VARIANT),
                source.signature,
                move |_, _| async move {
                    Ok(SourceText::from(rewrite_import_meta_url(&text, &url)))
                },
            )
            .await
    }

    /// `/@fs/...` under the fs root; elsewhere the absolute path itself.
    fn served_url(&self, path: &Path) -> String {
        fs_url(&self.fs_root, path).unwrap_or_else(|| {
            let slashed = path
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/");
            format!("/{slashed}")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devito_graph::runtime::test_utils::MemoryRuntime;

    fn setup() -> (Arc<MemoryRuntime>, CacheManager, DerivedSources) {
        let rt = Arc::new(MemoryRuntime::new());
        let manager = CacheManager::new();
        let derived = DerivedSources::new(&manager, rt.clone(), "/home");
        (rt, manager, derived)
    }

    #[tokio::test]
    async fn source_is_read_once_per_signature() {
        let (rt, _manager, derived) = setup();
        rt.write("/home/p/a.ts", "one");
        assert_eq!(&*derived.source(Path::new("/home/p/a.ts")).await.unwrap().payload, "one");
        assert_eq!(&*derived.source(Path::new("/home/p/a.ts")).await.unwrap().payload, "one");
        assert_eq!(rt.reads(), 1);

        rt.write("/home/p/a.ts", "two");
        assert_eq!(&*derived.source(Path::new("/home/p/a.ts")).await.unwrap().payload, "two");
        assert_eq!(rt.reads(), 2);
    }

    #[tokio::test]
    async fn import_meta_url_uses_fs_path() {
        let (rt, manager, derived) = setup();
        rt.write("/home/p/w.js", "new URL('x', import.meta.url)");

        let out = derived.with_import_meta_url(Path::new("/home/p/w.js")).await.unwrap();
        assert!(out.payload.contains("\"/@fs/p/w.js\""));
        assert!(!out.payload.contains("import.meta.url"));

        assert_eq!(manager.forget(Path::new("/home/p/w.js")), 2);
    }

    #[tokio::test]
    async fn primed_source_wins_over_disk() {
        let (rt, _manager, derived) = setup();
        rt.write("/home/p/entry.ts", "on disk");
        derived.prime_source(Path::new("/home/p/entry.ts"), "in memory");
        let got = derived.source(Path::new("/home/p/entry.ts")).await.unwrap();
        assert_eq!(&*got.payload, "in memory");
        assert_eq!(rt.reads(), 0);
    }

    /// Saves `next` right after the first read of its path returns.
    #[derive(Debug)]
    struct SaveAfterRead {
        inner: Arc<MemoryRuntime>,
        next: parking_lot::Mutex<Option<(PathBuf, String)>>,
    }

    #[async_trait::async_trait]
    impl Runtime for SaveAfterRead {
        async fn read_file(&self, path: &Path) -> devito_graph::RuntimeResult<Vec<u8>> {
            let bytes = self.inner.read_file(path).await?;
            let mut next = self.next.lock();
            if next.as_ref().is_some_and(|(p, _)| p.as_path() == path) {
                if let Some((p, text)) = next.take() {
                    self.inner.write(p, text);
                }
            }
            Ok(bytes)
        }

        async fn metadata(&self, path: &Path) -> devito_graph::RuntimeResult<devito_graph::FileMetadata> {
            self.inner.metadata(path).await
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        async fn canonicalize(&self, path: &Path) -> devito_graph::RuntimeResult<PathBuf> {
            self.inner.canonicalize(path).await
        }

        async fn resolve_external(
            &self,
            specifier: &str,
            from_dir: &Path,
        ) -> devito_graph::RuntimeResult<Option<PathBuf>> {
            self.inner.resolve_external(specifier, from_dir).await
        }
    }

    #[tokio::test]
    async fn rewrite_follows_a_save_during_the_read() {
        let inner = Arc::new(MemoryRuntime::new());
        inner.write("/home/p/w.js", "log(import.meta.url, 'one')");
        let rt = Arc::new(SaveAfterRead {
            inner: inner.clone(),
            next: parking_lot::Mutex::new(Some((
                PathBuf::from("/home/p/w.js"),
                "log(import.meta.url, 'VERSION-TWO')".to_string(),
            ))),
        });
        let manager = CacheManager::new();
        let derived = DerivedSources::new(&manager, rt, "/home");
        let path = Path::new("/home/p/w.js");

        let first = derived.with_import_meta_url(path).await.unwrap();
        assert!(first.payload.contains("'one'"));

        for _ in 0..3 {
            let out = derived.with_import_meta_url(path).await.unwrap();
            assert!(out.payload.contains("'VERSION-TWO'"), "stale: {}", out.payload);
            assert!(out.payload.contains("\"/@fs/p/w.js\""));
        }
    }

    #[tokio::test]
    async fn files_outside_fs_root_are_served() {
        let (rt, _manager, derived) = setup();
        rt.write("/srv/app/plain.ts", "export const x = 1;");
        rt.write("/srv/app/worker.js", "new URL('x', import.meta.url)");

        let plain = derived.with_import_meta_url(Path::new("/srv/app/plain.ts")).await.unwrap();
        assert_eq!(&*plain.payload, "export const x = 1;");

        let worker = derived.with_import_meta_url(Path::new("/srv/app/worker.js")).await.unwrap();
        assert!(worker.payload.contains("\"/srv/app/worker.js\""));
        assert!(!worker.payload.contains("import.meta.url"));
    }
}
