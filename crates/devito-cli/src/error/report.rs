//! Miette report conversion for CLI errors.

use devito_core::BuildError;
use miette::Report;

use crate::error::CliError;

/// Convert a `CliError` into a report for display.
pub fn cli_error_to_miette(err: CliError) -> Report {
    match err {
        CliError::Build(e) => build_error_to_miette(e),
        CliError::Config(e) => miette::miette!("Configuration error: {}", e),
        CliError::FileNotFound(path) => miette::miette!(
            help = "Pass an existing file; suffixes like .ts and index files are tried automatically",
            "Entry point not found: {}",
            path.display()
        ),
        _ => miette::miette!("{}", err),
    }
}

/// Convert a core `BuildError` into a report.
pub fn build_error_to_miette(err: BuildError) -> Report {
    match err {
        BuildError::Compile(failure) => miette::miette!(
            help = "Fix the errors above; the server keeps running and rebuilds on save",
            "{}",
            failure
        ),
        BuildError::Watch(msg) => miette::miette!(
            help = "Run with --no-watch to serve without file watching",
            "File watcher error: {}",
            msg
        ),
        _ => miette::miette!("{}", err),
    }
}
