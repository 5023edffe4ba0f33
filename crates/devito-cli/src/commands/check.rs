//! `devito check`: load and validate the configuration without serving.

use std::path::Path;

use devito_graph::{fs_url, NativeRuntime};

use crate::cli::CheckArgs;
use crate::commands::dev::resolve_entry;
use crate::config::DevitoConfig;
use crate::error::Result;
use crate::ui;

pub async fn execute(args: CheckArgs, quiet: bool) -> Result<()> {
    let config = DevitoConfig::load(&args.serve, quiet)?;
    config.validate()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let cwd = std::env::current_dir()?;
    let entry = resolve_entry(&NativeRuntime::new(), &config.entry_path(&cwd)).await?;
    let root = config.root_path(&cwd);
    let fs_root = config.fs_root_path(&cwd)?;

    ui::info(&format!("Entry point: {}", entry.display()));
    ui::info(&format!("Root: {}", root.display()));
    ui::info(&format!("Files under: {}", fs_root.display()));
    ui::info(&format!("Mode: {}", mode(&config, &entry)));
    match fs_url(&fs_root, &entry) {
        Some(url) => ui::info(&format!("Entry URL: {url}")),
        None => ui::warning("The entry is outside fs_root; unbundled mode cannot serve it"),
    }
    ui::info(&format!("Address: {}", ui::address(&config.url(config.port))));
    ui::success("Configuration is valid");
    Ok(())
}

fn mode(config: &DevitoConfig, entry: &Path) -> &'static str {
    if entry.extension().is_some_and(|ext| ext == "html") {
        "page"
    } else if config.bundle {
        "bundled"
    } else {
        "unbundled"
    }
}
