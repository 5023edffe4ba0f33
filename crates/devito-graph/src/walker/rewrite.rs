//! Specifier rewriting.

use regex::{Captures, Regex};
use rustc_hash::FxHashMap;
use std::sync::LazyLock;

static QUOTED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"'([^'\n]*)'|"([^"\n]*)""#).ok());

/// Replace every single- or double-quoted occurrence of a specifier with its
/// rewritten form, keeping the original quote style.
///
/// The replacement is a single pass, so a rewritten specifier is never
/// rewritten a second time.
pub fn rewrite_specifiers(source: &str, replacements: &FxHashMap<String, String>) -> String {
    let Some(quoted) = QUOTED.as_ref().filter(|_| !replacements.is_empty()) else {
        return source.to_string();
    };
    quoted
        .replace_all(source, |caps: &Captures<'_>| {
            let (quote, inner) = match (caps.get(1), caps.get(2)) {
                (Some(m), _) => ('\'', m.as_str()),
                (None, Some(m)) => ('"', m.as_str()),
                (None, None) => return caps[0].to_string(),
            };
            match replacements.get(inner) {
                Some(to) => format!("{quote}{to}{quote}"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
