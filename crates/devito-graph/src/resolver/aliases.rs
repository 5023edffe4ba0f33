//! Alias table lookup.
//!
//! Aliases are exact-match: `"react"` maps only the specifier `react`, never
//! `react/jsx-runtime`. Targets are absolute paths.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Specifier → absolute path table.
pub type AliasTable = BTreeMap<String, PathBuf>;

/// Exact alias match for a specifier.
pub fn resolve_alias<'a>(specifier: &str, aliases: &'a AliasTable) -> Option<&'a Path> {
    aliases.get(specifier).map(PathBuf::as_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_matches_exactly() {
        let mut table = AliasTable::new();
        table.insert("react".into(), PathBuf::from("/vendor/react.js"));

        assert_eq!(
            resolve_alias("react", &table),
            Some(Path::new("/vendor/react.js"))
        );
        assert_eq!(resolve_alias("react/jsx-runtime", &table), None);
        assert_eq!(resolve_alias("preact", &table), None);
    }
}
