//! devito CLI - dev server for ES modules with live reload.
//!
//! - [`cli`] - argument definitions
//! - [`config`] - layered configuration (`devito.toml`, `DEVITO_*`, flags)
//! - [`esbuild`] - the esbuild-backed [`Compiler`](devito_core::Compiler)
//! - [`server`] - HTTP routes, SSE endpoint and the HTML shell
//! - [`commands`] - `dev` and `check`
//!
//! ```rust,no_run
//! use devito_cli::{error::Result, logger};
//!
//! fn main() -> Result<()> {
//!     logger::init_logger(false, false, false);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod esbuild;
pub mod logger;
pub mod server;
pub mod ui;

pub use config::DevitoConfig;
pub use error::{CliError, ConfigError, Result};
