//! Path ↔ specifier ↔ URL conversions.
//!
//! Files are exposed to the browser under `/@fs/<path relative to fs_root>`.
//! Relative imports are rewritten to exact relative specifiers so the browser
//! requests the same file the resolver found.

use path_clean::PathClean;
use std::path::{Component, Path, PathBuf};

/// URL prefix under which filesystem files are exposed.
pub const FS_PREFIX: &str = "@fs";

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative specifier that, joined to `from_dir`, names `target`.
///
/// Same-directory and descendant targets get an explicit `./` prefix.
pub fn relative_specifier(from_dir: &Path, target: &Path) -> String {
    let from = from_dir.to_path_buf().clean();
    let target = target.to_path_buf().clean();

    let from_parts: Vec<Component<'_>> = from.components().collect();
    let target_parts: Vec<Component<'_>> = target.components().collect();
    let common = from_parts
        .iter()
        .zip(&target_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from_parts.len() {
        rel.push("..");
    }
    for part in &target_parts[common..] {
        rel.push(part.as_os_str());
    }

    let rel = to_slash(&rel);
    if rel.starts_with("../") || rel == ".." {
        rel
    } else {
        format!("./{rel}")
    }
}

/// `/@fs/...` URL for a file under `fs_root`.
pub fn fs_url(fs_root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(fs_root).ok()?;
    Some(format!("/{}/{}", FS_PREFIX, to_slash(rel)))
}

/// Inverse of [`fs_url`]. Rejects URLs that escape `fs_root`.
pub fn fs_path(fs_root: &Path, url_path: &str) -> Option<PathBuf> {
    let rest = url_path
        .strip_prefix('/')
        .unwrap_or(url_path)
        .strip_prefix(FS_PREFIX)?
        .strip_prefix('/')?;
    let path = fs_root.join(rest).clean();
    path.starts_with(fs_root).then_some(path)
}
