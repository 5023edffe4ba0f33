//! HTTP server.
//!
//! | route | serves |
//! |---|---|
//! | `/onreload` | SSE stream of bus messages |
//! | `/` | HTML shell |
//! | `/devito.js` | live-reload client |
//! | `/devito-sw.js` | service worker caching scripts and styles |
//! | `/onmissing` | unbundled mode: bare imports the browser could not resolve |
//! | `/bundle*` | bundled outputs, once the pending build settles |
//! | `/@fs/*` | per-file modules under the fs root |
//! | `*.{js,ts,...}` | per-file modules under the root |
//! | anything else | static files under the root |

mod handlers;
pub mod html;

use axum::{
    extract::Request,
    http::{header, HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;

use devito_core::{artifact::now_ms, BuildCoordinator, ChangeBus, OnDemandBuilder};
use devito_graph::fs_url;

use crate::config::DevitoConfig;
use crate::error::{CliError, Result};

/// What the server needs to know from the configuration.
#[derive(Debug, Clone)]
pub struct ServeSettings {
    /// Absolute entry point.
    pub entry: PathBuf,
    pub root: PathBuf,
    pub fs_root: PathBuf,
    pub bundle: bool,
    pub cache: bool,
    pub watch: bool,
    pub quiet: bool,
}

impl ServeSettings {
    pub fn new(config: &DevitoConfig, entry: PathBuf, root: PathBuf, fs_root: PathBuf) -> Self {
        Self {
            entry,
            root,
            fs_root,
            bundle: config.bundle,
            cache: config.cache,
            watch: config.watch,
            quiet: config.quiet,
        }
    }

    /// An `.html` entry is served as-is instead of through the shell.
    pub fn is_page(&self) -> bool {
        self.entry.extension().is_some_and(|ext| ext == "html")
    }

    /// Entry path relative to the root, for the page title.
    pub fn title(&self) -> String {
        self.entry
            .strip_prefix(&self.root)
            .ok()
            .or_else(|| self.entry.file_name().map(Path::new))
            .unwrap_or(&self.entry)
            .display()
            .to_string()
    }

    /// URL of the entry as a file: under the root when possible, else `/@fs/`.
    pub fn entry_url(&self) -> Option<String> {
        match self.entry.strip_prefix(&self.root) {
            Ok(rel) => Some(format!(
                "/{}",
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            )),
            Err(_) => fs_url(&self.fs_root, &self.entry),
        }
    }
}

/// Everything the handlers share.
#[derive(Debug)]
pub struct ServerState {
    settings: ServeSettings,
    /// `None` in unbundled and page mode.
    coordinator: Option<Arc<BuildCoordinator>>,
    on_demand: Arc<OnDemandBuilder>,
    bus: ChangeBus,
    started_ms: u64,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(
        settings: ServeSettings,
        coordinator: Option<Arc<BuildCoordinator>>,
        on_demand: Arc<OnDemandBuilder>,
        bus: ChangeBus,
    ) -> SharedState {
        Arc::new(Self {
            settings,
            coordinator,
            on_demand,
            bus,
            started_ms: now_ms(),
        })
    }

    pub fn settings(&self) -> &ServeSettings {
        &self.settings
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// `policy` when caching is on, `no-store` otherwise.
    fn cache_control(&self, policy: &'static str) -> &'static str {
        if self.settings.cache {
            policy
        } else {
            "no-store"
        }
    }
}

/// The router with every route and the common headers.
pub fn router(state: SharedState) -> Router {
    let log = !state.settings.quiet;
    let app = Router::new()
        .route("/onreload", get(handlers::onreload))
        .route("/", get(handlers::index))
        .route("/devito.js", get(handlers::client_script))
        .route("/devito-sw.js", get(handlers::service_worker))
        .route("/onmissing", get(handlers::missing_import))
        .route("/@fs/{*path}", get(handlers::fs_module))
        .fallback(handlers::fallback)
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cross-origin-opener-policy"),
            HeaderValue::from_static("same-origin"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cross-origin-embedder-policy"),
            HeaderValue::from_static("require-corp"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .with_state(state);

    if log {
        app.layer(middleware::from_fn(log_request))
    } else {
        app
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    if path != "/onreload" {
        crate::ui::request(method.as_str(), &path, response.status().as_u16());
    }
    response
}

/// Ports tried after the configured one is taken.
const PORT_ATTEMPTS: u16 = 10;

/// Development server.
pub struct DevServer {
    host: String,
    port: u16,
    state: SharedState,
}

impl DevServer {
    pub fn new(host: impl Into<String>, port: u16, state: SharedState) -> Self {
        Self {
            host: host.into(),
            port,
            state,
        }
    }

    /// Bind the configured port, or the next free one when it is taken.
    ///
    /// Separate from [`DevServer::serve`] so bind errors surface before the
    /// server task is spawned.
    pub async fn bind(&self) -> Result<tokio::net::TcpListener> {
        let mut last_error = None;
        for offset in 0..PORT_ATTEMPTS {
            let Some(port) = self.port.checked_add(offset) else {
                break;
            };
            match tokio::net::TcpListener::bind((self.host.as_str(), port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && self.port != 0 => {
                    tracing::debug!("port {} in use", port);
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(CliError::Server(format!(
                        "failed to bind {}:{}: {}",
                        self.host, port, e
                    )));
                }
            }
        }
        Err(CliError::Server(format!(
            "no free port in {}..{} on {}: {}",
            self.port,
            self.port.saturating_add(PORT_ATTEMPTS),
            self.host,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Serve until the listener fails.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> Result<()> {
        axum::serve(listener, router(self.state))
            .await
            .map_err(|e| CliError::Server(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(entry: &str) -> ServeSettings {
        ServeSettings {
            entry: PathBuf::from(entry),
            root: PathBuf::from("/home/dev/app"),
            fs_root: PathBuf::from("/home/dev"),
            bundle: true,
            cache: true,
            watch: true,
            quiet: false,
        }
    }

    #[test]
    fn test_title_is_relative_to_root() {
        assert_eq!(settings("/home/dev/app/src/index.ts").title(), "src/index.ts");
        assert_eq!(settings("/elsewhere/main.ts").title(), "main.ts");
    }

    #[test]
    fn test_entry_url() {
        assert_eq!(
            settings("/home/dev/app/index.html").entry_url().as_deref(),
            Some("/index.html")
        );
        assert_eq!(
            settings("/home/dev/lib/page.html").entry_url().as_deref(),
            Some("/@fs/lib/page.html")
        );
        assert_eq!(settings("/opt/page.html").entry_url(), None);
    }

    #[test]
    fn test_page_mode() {
        assert!(settings("/home/dev/app/index.html").is_page());
        assert!(!settings("/home/dev/app/index.ts").is_page());
    }
}
