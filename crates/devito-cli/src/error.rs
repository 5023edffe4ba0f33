//! Error types for the devito CLI.
//!
//! `CliError` is what commands return; [`cli_error_to_miette`] turns it into a
//! report for display. Configuration problems carry a hint telling the user
//! what to change.

use std::path::PathBuf;
use thiserror::Error;

mod report;

pub use report::cli_error_to_miette;

/// Top-level CLI error type.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Build, watch or cache failure from the core.
    #[error("Build error: {0}")]
    Build(#[from] devito_core::BuildError),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binding or serving failed.
    #[error("Server error: {0}")]
    Server(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {}\n\nHint: Create devito.toml or pass --config <path>", .0.display())]
    NotFound(PathBuf),

    /// figment could not merge or extract the layered sources.
    #[error("Invalid configuration: {0}\n\nHint: Check devito.toml syntax and DEVITO_* variables")]
    Invalid(String),

    #[error("Missing required field: {field}\n\nHint: {hint}")]
    MissingField { field: String, hint: String },

    #[error("Invalid value for '{field}': {value}\n\nHint: {hint}")]
    InvalidValue {
        field: String,
        value: String,
        hint: String,
    },

    #[error("Conflicting options: {0}\n\nHint: These options cannot be used together")]
    ConflictingOptions(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

/// Result type alias using `CliError` as the default error type.
pub type Result<T, E = CliError> = std::result::Result<T, E>;
