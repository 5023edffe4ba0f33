//! Logging setup built on `tracing`.
//!
//! `--verbose` enables debug output for the devito crates, `--quiet` keeps
//! errors only, otherwise `RUST_LOG` is honoured with an info-level default.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERBOSE_FILTER: &str =
    "devito=debug,devito_cli=debug,devito_core=debug,devito_cache=debug,devito_graph=debug";
const QUIET_FILTER: &str = "devito=error,devito_cli=error,devito_core=error";
const DEFAULT_FILTER: &str = "devito=info,devito_cli=info,devito_core=info,devito_cache=warn";

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logger(verbose: bool, quiet: bool, no_color: bool) {
    init_logger_with_filter(filter_for(verbose, quiet), no_color);
}

/// Install the global subscriber with an explicit filter.
pub fn init_logger_with_filter(filter: EnvFilter, no_color: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_ansi(!no_color && should_use_colors())
        .compact();

    // a second init (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn filter_for(verbose: bool, quiet: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else if quiet {
        EnvFilter::new(QUIET_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Whether the terminal should get ANSI colors.
///
/// `NO_COLOR` disables and `FORCE_COLOR` forces; otherwise the terminal's
/// capabilities decide.
pub fn should_use_colors() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    console::Term::stderr().features().colors_supported()
}
