//! `devito dev`: build, serve and rebuild until Ctrl+C.
//!
//! Bundled mode builds the entry through a [`BuildCoordinator`] and serves
//! `/bundle.*` from it. Unbundled mode analyzes the entry up front so the
//! import map is complete, then compiles each module on request. An `.html`
//! entry is served as a page, its scripts going through `/@fs/` or the root.

use path_clean::PathClean;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::sync::mpsc;

use devito_cache::{CacheManager, DerivedSources};
use devito_core::{
    BuildCoordinator, BuildError, BusNotifier, ChangeBus, Compiler, CoordinatorOptions, FileWatcher,
    NotifyWatcher, OnDemandBuilder, WatchSubscription,
};
use devito_graph::resolver::resolve_with_extensions;
use devito_graph::{AnalyzeOptions, NativeRuntime, Runtime};

use crate::cli::DevArgs;
use crate::config::DevitoConfig;
use crate::error::{CliError, Result};
use crate::esbuild::EsbuildCompiler;
use crate::server::{DevServer, ServeSettings, ServerState, SharedState};
use crate::ui;

/// The collaborators a session is built from. Tests swap in fakes.
pub struct Services {
    pub runtime: Arc<dyn Runtime>,
    pub compiler: Arc<dyn Compiler>,
    pub watcher: Arc<dyn FileWatcher>,
}

/// Watcher for `--no-watch`: subscriptions never yield.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unwatched;

impl FileWatcher for Unwatched {
    fn watch(&self, _dir: &Path) -> devito_core::Result<WatchSubscription> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(WatchSubscription::from_receiver(rx))
    }
}

pub async fn execute(args: DevArgs, quiet: bool) -> Result<()> {
    let config = DevitoConfig::load(&args.serve, quiet)?;
    config.validate()?;

    let cwd = std::env::current_dir()?;
    let runtime: Arc<dyn Runtime> = Arc::new(NativeRuntime::new());
    let entry = resolve_entry(runtime.as_ref(), &config.entry_path(&cwd)).await?;
    let root = config.root_path(&cwd);
    let fs_root = config.fs_root_path(&cwd)?;

    if !entry.starts_with(&fs_root) {
        ui::warning(&format!(
            "{} is outside {}; its modules cannot be served under /@fs/",
            entry.display(),
            fs_root.display()
        ));
    }
    if !config.quiet {
        ui::info(&format!("Entry point: {}", entry.display()));
        ui::info(&format!("Serving {} (files under {})", root.display(), fs_root.display()));
    }

    let services = Services {
        runtime,
        compiler: Arc::new(
            EsbuildCompiler::new(&config.esbuild, &fs_root).with_aliases(config.alias.clone()),
        ),
        watcher: if config.watch {
            Arc::new(NotifyWatcher::new())
        } else {
            Arc::new(Unwatched)
        },
    };
    let extra: Vec<PathBuf> = config
        .extra_analyze_paths
        .iter()
        .map(|path| cwd.join(path).clean())
        .collect();
    let settings = ServeSettings::new(&config, entry, root, fs_root);
    let state = prepare(&config, settings, &extra, services).await?;

    let server = DevServer::new(config.host.clone(), config.port, state);
    let listener = server.bind().await?;
    let port = listener.local_addr()?.port();
    ui::success(&format!("Listening on {}", ui::address(&config.url(port))));
    if !config.quiet {
        ui::info("Press Ctrl+C to stop");
    }

    let mut server_handle = tokio::spawn(server.serve(listener));
    tokio::select! {
        _ = signal::ctrl_c() => {
            ui::info("Shutting down development server...");
            server_handle.abort();
            Ok(())
        }
        result = &mut server_handle => match result {
            Ok(result) => result,
            Err(e) => Err(CliError::Server(format!("server task failed: {e}"))),
        },
    }
}

/// Wire caches, bus, builders and the initial build into server state.
///
/// A failing initial build is reported but not fatal: the entry stays
/// watched and the next save rebuilds.
pub async fn prepare(
    config: &DevitoConfig,
    settings: ServeSettings,
    extra_analyze_paths: &[PathBuf],
    services: Services,
) -> Result<SharedState> {
    let Services {
        runtime,
        compiler,
        watcher,
    } = services;

    let caches = Arc::new(CacheManager::new());
    let sources = DerivedSources::new(&caches, runtime.clone(), &settings.fs_root);
    let bus = ChangeBus::new();

    let analyze = AnalyzeOptions::new(&settings.fs_root)
        .with_external_resolution(true)
        .with_aliases(config.alias.clone());
    let on_demand = OnDemandBuilder::new(
        runtime,
        analyze,
        compiler.clone(),
        sources.clone(),
        caches.clone(),
        watcher.clone(),
        bus.clone(),
        config.debounce(),
    );

    let coordinator = if settings.is_page() {
        None
    } else if settings.bundle {
        let options = CoordinatorOptions::new(&settings.entry)
            .with_debounce(config.debounce())
            .with_source_maps(config.source_maps());
        let coordinator = BuildCoordinator::new(
            options,
            compiler,
            sources,
            caches,
            watcher,
            Arc::new(BusNotifier::new(bus.clone())),
        );

        let started = Instant::now();
        match coordinator.initial_build().await {
            Ok(()) if !config.quiet => ui::success(&format!(
                "Initial build completed in {}ms, watching {} files",
                started.elapsed().as_millis(),
                coordinator.watched().files().count()
            )),
            Ok(()) => {}
            Err(e) => ui::error(&format!("Initial build failed: {e}")),
        }
        Some(coordinator)
    } else {
        let mut visited = 0;
        for path in std::iter::once(&settings.entry).chain(extra_analyze_paths) {
            match on_demand.analyze(path).await {
                Ok(count) => visited += count,
                Err(e) => ui::warning(&format!("Could not analyze {}: {e}", path.display())),
            }
        }
        if !config.quiet {
            ui::info(&format!(
                "Analyzed {} modules, {} bare imports mapped",
                visited,
                on_demand.import_map().imports.len()
            ));
        }
        None
    };

    Ok(ServerState::new(settings, coordinator, on_demand, bus))
}

/// The entry as given, or with a known suffix or `index` file appended,
/// canonicalized.
pub async fn resolve_entry(runtime: &dyn Runtime, entry: &Path) -> Result<PathBuf> {
    let found = resolve_with_extensions(runtime, entry)
        .await
        .map_err(BuildError::from)?
        .ok_or_else(|| CliError::FileNotFound(entry.to_path_buf()))?;
    let canonical = runtime
        .canonicalize(&found)
        .await
        .map_err(BuildError::from)?;
    Ok(canonical)
}
