//! Import scanning.
//!
//! Sources are scanned with regular expressions rather than parsed: the only
//! thing the dev server needs is the list of quoted specifiers, and the
//! compiler collaborator still sees the full file.

use regex::Regex;
use std::sync::LazyLock;

/// How a specifier was imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import x from '...'` / `export { x } from '...'`
    Static,
    /// `import '...'`
    SideEffect,
    /// `import('...')`
    Dynamic,
    /// `require('...')`
    Require,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedImport {
    pub specifier: String,
    pub kind: ImportKind,
}

// Patterns are literals; `None` only if one fails to compile, which scans nothing.
static STATIC_IMPORT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"\b(?:import|export)\b[^;'"]*?\bfrom\s*['"]([^'"\n]+)['"]"#).ok()
});

static SIDE_EFFECT_IMPORT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"\bimport\s*['"]([^'"\n]+)['"]"#).ok());

static DYNAMIC_IMPORT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"\bimport\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).ok());

static REQUIRE_CALL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"\brequire\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).ok());

/// Scan `source` for import specifiers.
///
/// Results are ordered by position in the source and deduplicated by
/// specifier (first occurrence wins).
pub fn scan_imports(source: &str) -> Vec<ScannedImport> {
    let patterns: [(&Option<Regex>, ImportKind); 4] = [
        (&STATIC_IMPORT, ImportKind::Static),
        (&SIDE_EFFECT_IMPORT, ImportKind::SideEffect),
        (&DYNAMIC_IMPORT, ImportKind::Dynamic),
        (&REQUIRE_CALL, ImportKind::Require),
    ];

    let mut found: Vec<(usize, ScannedImport)> = Vec::new();
    for (regex, kind) in patterns {
        let Some(regex) = regex.as_ref() else {
            continue;
        };
        for caps in regex.captures_iter(source) {
            if let Some(m) = caps.get(1) {
                found.push((
                    m.start(),
                    ScannedImport {
                        specifier: m.as_str().to_string(),
                        kind,
                    },
                ));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = rustc_hash::FxHashSet::default();
    found
        .into_iter()
        .map(|(_, import)| import)
        .filter(|import| seen.insert(import.specifier.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specifiers(source: &str) -> Vec<String> {
        scan_imports(source).into_iter().map(|i| i.specifier).collect()
    }

    #[test]
    fn finds_every_import_form() {
        let source = r#"
import React from 'react';
import { a,
  b } from "./ab";
import * as ns from './ns.js'
export { c } from './c';
export * from "./star";
import './side-effect.css';
const lazy = () => import('./lazy');
const cjs = require("./cjs");
"#;
        assert_eq!(
            specifiers(source),
            vec!["react", "./ab", "./ns.js", "./c", "./star", "./side-effect.css", "./lazy", "./cjs"]
        );
    }

    #[test]
    fn kinds_are_reported() {
        let imports = scan_imports("import './a'; import('./b'); require('./c'); import d from './d'");
        let kinds: Vec<_> = imports.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![ImportKind::SideEffect, ImportKind::Dynamic, ImportKind::Require, ImportKind::Static]
        );
    }

    #[test]
    fn duplicates_are_dropped() {
        assert_eq!(
            specifiers("import a from './x'; import { b } from './x'; import('./x')"),
            vec!["./x"]
        );
    }

    #[test]
    fn plain_strings_are_not_imports() {
        assert!(specifiers("const s = 'from ./x'; const t = \"import\";").is_empty());
        assert!(specifiers("const reimport = 1; myrequire('./x')").is_empty());
    }
}
