//! Route handlers.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, response::Builder, HeaderMap, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
};
use path_clean::PathClean;
use serde::Deserialize;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};

use devito_cache::CacheError;
use devito_core::{artifact::JAVASCRIPT, content_type_for, Artifact, ArtifactMeta, BuildError};
use devito_graph::{fs_path, fs_url, StatSignature};

use super::{html, SharedState};

/// Shell, client script and static files.
const STATIC_POLICY: &str = "public, max-age=720";
/// Build outputs: always revalidated against the etag.
const BUILD_POLICY: &str = "public, max-age=0";

const MODULE_EXTENSIONS: &[&str] = &[
    "js", "mjs", "cjs", "jsx", "mjsx", "ts", "mts", "cts", "tsx", "mtsx", "css", "json",
];
const SOURCE_EXTENSIONS: &[&str] = &["js", "mjs", "jsx", "ts", "mts", "tsx"];

pub(super) async fn onreload(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client = state.bus.connect();
    tracing::info!(
        "client {} connected ({} connected)",
        client.id(),
        state.bus.client_count()
    );

    let stream = client.map(|data| Ok(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

pub(super) async fn index(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if state.settings.is_page() {
        return match state.settings.entry_url() {
            Some(url) => finish(
                Response::builder()
                    .status(StatusCode::FOUND)
                    .header(header::LOCATION, url),
                Body::empty(),
            ),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    let import_map = (!state.settings.bundle).then(|| state.on_demand.import_map());
    let body = html::shell(&state.settings.title(), import_map.as_ref());
    let etag = generated_etag(&state, &body);
    cacheable(
        &state,
        &headers,
        &etag,
        STATIC_POLICY,
        "text/html; charset=utf-8",
        body,
    )
}

pub(super) async fn client_script(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let body = html::client_script(
        state.settings.watch,
        state.settings.quiet,
        !state.settings.bundle,
    );
    let etag = generated_etag(&state, &body);
    cacheable(&state, &headers, &etag, STATIC_POLICY, JAVASCRIPT, body)
}

pub(super) async fn service_worker(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let etag = generated_etag(&state, html::SERVICE_WORKER);
    cacheable(
        &state,
        &headers,
        &etag,
        STATIC_POLICY,
        JAVASCRIPT,
        html::SERVICE_WORKER,
    )
}

pub(super) async fn fs_module(
    State(state): State<SharedState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match fs_path(&state.settings.fs_root, uri.path()) {
        Some(path) => module_or_file(&state, &headers, path).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct MissingImport {
    specifier: String,
    /// URL path of the importing module.
    importer: String,
}

/// A bare import the browser failed to resolve. Known packages are aliased
/// and the importer invalidated (`204`); the bus `update` reloads the page.
pub(super) async fn missing_import(
    State(state): State<SharedState>,
    Query(missing): Query<MissingImport>,
) -> Response {
    if state.settings.bundle {
        return StatusCode::NOT_FOUND.into_response();
    }
    let importer = fs_path(&state.settings.fs_root, &missing.importer)
        .or_else(|| under_root(&state.settings.root, &missing.importer));
    let Some(importer) = importer else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match state
        .on_demand
        .report_missing(&missing.specifier, &importer)
        .await
    {
        Ok(Some(_)) => StatusCode::NO_CONTENT.into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!("'{}' from {}: {}", missing.specifier, importer.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// `/bundle*`, source files under the root, then static files.
pub(super) async fn fallback(
    State(state): State<SharedState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let url = uri.path();
    if url.starts_with("/bundle") {
        return bundle(&state, &headers, url).await;
    }

    let Some(path) = under_root(&state.settings.root, url) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if has_extension(&path, SOURCE_EXTENSIONS) {
        module(&state, &headers, &path).await
    } else {
        static_file(&state, &headers, &path).await
    }
}

async fn bundle(state: &SharedState, headers: &HeaderMap, url: &str) -> Response {
    let Some(coordinator) = &state.coordinator else {
        return unbundled_entry(state, headers, url);
    };

    let built = coordinator.wait_for_build().await;
    let artifacts = coordinator.artifacts();
    match (artifacts.get(url), built) {
        (Some(artifact), built) => {
            if let Err(e) = built {
                tracing::debug!("serving {} from the last good build: {}", url, e);
            }
            serve_artifact(state, headers, artifact)
        }
        (None, Err(e)) => {
            tracing::warn!("{} unavailable: {}", url, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        (None, Ok(())) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Unbundled `/bundle.js` is a one-line module importing the entry through
/// `/@fs/`, so every module below it is served per file.
fn unbundled_entry(state: &SharedState, headers: &HeaderMap, url: &str) -> Response {
    let body = match url {
        "/bundle.js" => match fs_url(&state.settings.fs_root, &state.settings.entry) {
            Some(entry) => format!("import {};\n", quote(&entry)),
            None => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(
                        "{} is outside {}",
                        state.settings.entry.display(),
                        state.settings.fs_root.display()
                    ),
                )
                    .into_response();
            }
        },
        "/bundle.css" => String::new(),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    let etag = generated_etag(state, &body);
    cacheable(state, headers, &etag, BUILD_POLICY, content_type_for(url), body)
}

async fn module_or_file(state: &SharedState, headers: &HeaderMap, path: PathBuf) -> Response {
    if has_extension(&path, MODULE_EXTENSIONS) {
        return module(state, headers, &path).await;
    }
    if path.file_name().is_some_and(|name| name == "jsx-runtime") {
        return match state.on_demand.discover(&path).await {
            Ok(Some(found)) => module(state, headers, &found).await,
            Ok(None) => StatusCode::NOT_FOUND.into_response(),
            Err(e) => {
                tracing::warn!("{}: {}", path.display(), e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        };
    }
    static_file(state, headers, &path).await
}

/// On-demand compiled module, etag from the source file's signature.
async fn module(state: &SharedState, headers: &HeaderMap, path: &Path) -> Response {
    match state.on_demand.artifact(path).await {
        Ok(cached) => cacheable(
            state,
            headers,
            &cached.signature.etag(),
            BUILD_POLICY,
            cached.payload.content_type,
            cached.payload.contents.to_vec(),
        ),
        Err(BuildError::Cache(CacheError::NotFound(_))) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!("{}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn static_file(state: &SharedState, headers: &HeaderMap, path: &Path) -> Response {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let etag = StatSignature::new(modified_ms, meta.len()).etag();

    if is_not_modified(headers, &etag) {
        return not_modified(state, &etag, STATIC_POLICY);
    }

    match tokio::fs::read(path).await {
        Ok(contents) => cacheable(
            state,
            headers,
            &etag,
            STATIC_POLICY,
            content_type_for(&path.to_string_lossy()),
            contents,
        ),
        Err(e) => {
            tracing::warn!("failed to read {}: {}", path.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn serve_artifact(state: &SharedState, headers: &HeaderMap, artifact: &Artifact) -> Response {
    cacheable(
        state,
        headers,
        &artifact.meta.etag(),
        BUILD_POLICY,
        artifact.content_type,
        artifact.contents.to_vec(),
    )
}

/// 200 with the body, or 304 when `If-None-Match` carries `etag`.
fn cacheable(
    state: &SharedState,
    headers: &HeaderMap,
    etag: &str,
    policy: &'static str,
    content_type: &str,
    body: impl Into<Body>,
) -> Response {
    if is_not_modified(headers, etag) {
        return not_modified(state, etag, policy);
    }
    finish(
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CACHE_CONTROL, state.cache_control(policy))
            .header(header::ETAG, etag)
            .header(header::CONTENT_TYPE, content_type),
        body.into(),
    )
}

fn not_modified(state: &SharedState, etag: &str, policy: &'static str) -> Response {
    finish(
        Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::CACHE_CONTROL, state.cache_control(policy))
            .header(header::ETAG, etag),
        Body::empty(),
    )
}

fn is_not_modified(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == etag)
}

fn finish(builder: Builder, body: Body) -> Response {
    builder.body(body).unwrap_or_else(|e| {
        tracing::error!("failed to build response: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

/// Etag for bodies generated at startup: fixed for the server's lifetime
/// unless the body size changes.
fn generated_etag(state: &SharedState, body: &str) -> String {
    ArtifactMeta {
        size: body.len() as u64,
        modified_ms: state.started_ms,
    }
    .etag()
}

/// Map a URL path to a file under `root`, refusing to escape it.
fn under_root(root: &Path, url: &str) -> Option<PathBuf> {
    let path = root.join(url.trim_start_matches('/')).clean();
    path.starts_with(root).then_some(path)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.contains(&ext))
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{text}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_root_refuses_traversal() {
        let root = Path::new("/srv/app");
        assert_eq!(
            under_root(root, "/css/site.css"),
            Some(PathBuf::from("/srv/app/css/site.css"))
        );
        assert_eq!(under_root(root, "/../secret.txt"), None);
        assert_eq!(under_root(root, "/"), Some(PathBuf::from("/srv/app")));
    }

    #[test]
    fn test_if_none_match() {
        let mut headers = HeaderMap::new();
        assert!(!is_not_modified(&headers, "\"1-2\""));
        headers.insert(header::IF_NONE_MATCH, "\"1-2\"".parse().unwrap());
        assert!(is_not_modified(&headers, "\"1-2\""));
        assert!(!is_not_modified(&headers, "\"1-3\""));
    }

    #[test]
    fn test_extensions() {
        assert!(has_extension(Path::new("/a/b.tsx"), SOURCE_EXTENSIONS));
        assert!(!has_extension(Path::new("/a/b.css"), SOURCE_EXTENSIONS));
        assert!(has_extension(Path::new("/a/b.css"), MODULE_EXTENSIONS));
        assert!(!has_extension(Path::new("/a/b.png"), MODULE_EXTENSIONS));
    }
}
