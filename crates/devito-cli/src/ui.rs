//! Status messages for the terminal.
//!
//! Everything goes to stderr so stdout stays free for `check --json`.

use owo_colors::OwoColorize;
use std::sync::atomic::{AtomicBool, Ordering};

static COLORS: AtomicBool = AtomicBool::new(true);

/// Apply `--no-color` and `NO_COLOR` to every later message.
pub fn init_colors(no_color: bool) {
    COLORS.store(!no_color && crate::logger::should_use_colors(), Ordering::Relaxed);
}

fn colors() -> bool {
    COLORS.load(Ordering::Relaxed)
}

pub fn success(message: &str) {
    if colors() {
        eprintln!("{} {}", "✓".green().bold(), message);
    } else {
        eprintln!("✓ {message}");
    }
}

pub fn info(message: &str) {
    if colors() {
        eprintln!("{} {}", "ℹ".blue().bold(), message);
    } else {
        eprintln!("ℹ {message}");
    }
}

pub fn warning(message: &str) {
    if colors() {
        eprintln!("{} {}", "⚠".yellow().bold(), message.yellow());
    } else {
        eprintln!("⚠ {message}");
    }
}

pub fn error(message: &str) {
    if colors() {
        eprintln!("{} {}", "✗".red().bold(), message.red());
    } else {
        eprintln!("✗ {message}");
    }
}

/// One served request: `12:04:33.120 200 GET /bundle.js`.
pub fn request(method: &str, path: &str, status: u16) {
    eprintln!("{}", format_request(method, path, status, colors()));
}

fn format_request(method: &str, path: &str, status: u16, colored: bool) -> String {
    let time = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
    if !colored {
        return format!("{time} {status} {method} {path}");
    }
    let status = match status {
        200..=299 => status.green().to_string(),
        300..=399 => status.cyan().to_string(),
        _ => status.red().to_string(),
    };
    format!("{} {} {} {}", time.dimmed(), status, method, path.bright_white())
}

/// A URL, underlined when colors are on.
pub fn address(url: &str) -> String {
    if colors() {
        url.yellow().underline().to_string()
    } else {
        url.to_string()
    }
}
