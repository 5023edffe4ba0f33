//! Pure source transforms applied before a file reaches the browser.

use std::path::Path;

/// How a file's text is turned into a browser module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// JavaScript/TypeScript; imports are scanned and rewritten.
    Script,
    /// Stylesheet, wrapped into a `<style>`-injecting module.
    Css,
    /// JSON, wrapped into a default-export module.
    Json,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("css") => SourceKind::Css,
            Some("json") => SourceKind::Json,
            _ => SourceKind::Script,
        }
    }
}

fn js_string(text: &str) -> String {
    // serde_json string escaping is a valid JS string literal
    serde_json::Value::String(text.to_string()).to_string()
}

/// Module that appends the stylesheet to `document.head` when evaluated.
pub fn wrap_css(text: &str) -> String {
    format!(
        "const style = document.createElement('style');\n\
         style.textContent = {};\n\
         document.head.appendChild(style);\n",
        js_string(text)
    )
}

/// Module whose default export is the JSON document.
pub fn wrap_json(text: &str) -> String {
    format!("export default {};\n", text.trim())
}

/// Apply the wrapper for `kind`, leaving scripts untouched.
pub fn module_source(kind: SourceKind, text: &str) -> String {
    match kind {
        SourceKind::Script => text.to_string(),
        SourceKind::Css => wrap_css(text),
        SourceKind::Json => wrap_json(text),
    }
}

/// Replace `import.meta.url` with an expression naming the file's `/@fs` URL.
///
/// Sandboxed frames report `location.origin` as the string `"null"`; the first
/// ancestor origin is used instead.
pub fn rewrite_import_meta_url(source: &str, fs_url: &str) -> String {
    if !source.contains("import.meta.url") {
        return source.to_string();
    }
    let expr = format!(
        "((location.origin === 'null' ? new URL(location.ancestorOrigins[0]).origin : location.origin) + {})",
        js_string(fs_url)
    );
    source.replace("import.meta.url", &expr)
}
