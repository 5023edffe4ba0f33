//! devito - dev server for ES modules with live reload.
//!
//! Parses arguments, installs logging and dispatches to the command.

use clap::Parser;
use devito_cli::{cli, commands, error, logger, ui};
use miette::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    logger::init_logger(args.verbose, args.quiet, args.no_color);
    ui::init_colors(args.no_color);

    let result = match args.command {
        cli::Command::Dev(dev_args) => commands::dev_execute(dev_args, args.quiet).await,
        cli::Command::Check(check_args) => commands::check_execute(check_args, args.quiet).await,
    };

    result.map_err(error::cli_error_to_miette)
}
