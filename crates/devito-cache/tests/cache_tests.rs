//! Resource cache behaviour tests.
//!
//! These tests verify:
//! - Coalescing of concurrent requests
//! - Invalidation on stat signature change
//! - Failures are not cached

use devito_cache::{CacheError, CacheKey, CacheManager, ResourceCache};
use devito_graph::runtime::test_utils::MemoryRuntime;
use devito_graph::NativeRuntime;
use futures::future::join_all;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// N concurrent requests with an unchanged signature run one compute.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_coalesce() {
    let rt = Arc::new(MemoryRuntime::new());
    rt.write("/p/index.ts", "export {}");
    let cache: Arc<ResourceCache<String>> = Arc::new(ResourceCache::new("compiled", rt));
    let calls = Arc::new(AtomicUsize::new(0));

    let requests = (0..16).map(|_| {
        let cache = cache.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cache
                .get_or_create(CacheKey::new("/p/index.ts"), move |_, _| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok("compiled".to_string())
                })
                .await
        })
    });

    let results = join_all(requests).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap().unwrap().payload, "compiled");
    }
}

/// A failing compute is reported to every waiter, then retried on the next
/// request.
#[tokio::test]
async fn test_failure_is_not_cached() {
    let rt = Arc::new(MemoryRuntime::new());
    rt.write("/p/broken.ts", "syntax error");
    let cache: ResourceCache<String> = ResourceCache::new("compiled", rt);
    let calls = Arc::new(AtomicUsize::new(0));

    let attempt = |fail: bool| {
        let calls = calls.clone();
        move |_: CacheKey, _| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err(CacheError::Compute("unexpected token".into()))
            } else {
                Ok("fixed".to_string())
            }
        }
    };

    let err = cache
        .get_or_create(CacheKey::new("/p/broken.ts"), attempt(true))
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::Compute("unexpected token".into()));
    assert!(cache.is_empty());

    let ok = cache
        .get_or_create(CacheKey::new("/p/broken.ts"), attempt(false))
        .await
        .unwrap();
    assert_eq!(ok.payload, "fixed");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// A compute task that dies without settling interrupts its waiters instead
/// of hanging them.
#[tokio::test]
async fn test_panicking_compute_interrupts_waiters() {
    let rt = Arc::new(MemoryRuntime::new());
    rt.write("/p/a.ts", "a");
    let cache: ResourceCache<String> = ResourceCache::new("compiled", rt);

    let err = cache
        .get_or_create(CacheKey::new("/p/a.ts"), |_, _| async {
            if true {
                panic!("compiler crashed");
            }
            Ok(String::new())
        })
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::Interrupted);
}

/// Changing a file on disk invalidates through its new signature.
#[tokio::test]
async fn test_real_file_change_invalidates() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("util.ts");
    std::fs::write(&path, "export const a = 1;").unwrap();

    let manager = CacheManager::new();
    let cache = manager.create::<String, CacheError>("source", Arc::new(NativeRuntime::new()));
    let read = |path: &Path| {
        let path = path.to_path_buf();
        move |_: CacheKey, _| async move {
            Ok::<_, CacheError>(std::fs::read_to_string(&path).unwrap_or_default())
        }
    };

    let first = cache
        .get_or_create(CacheKey::new(&path), read(&path))
        .await
        .unwrap();
    std::fs::write(&path, "export const a = 1, b = 2;").unwrap();
    let second = cache
        .get_or_create(CacheKey::new(&path), read(&path))
        .await
        .unwrap();

    assert_ne!(first.signature, second.signature);
    assert_eq!(second.payload, "export const a = 1, b = 2;");
    assert_eq!(manager.forget(&path), 1);
}
