//! Forbidden-modification rules for executor results.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize `path` relative to `root`.
///
/// Returns `None` when the path escapes the root, is absolute outside it, or
/// is empty. No filesystem access, so symlinks are not resolved.
pub fn normalize_relative(root: &Path, path: &str) -> Option<String> {
    let raw = Path::new(path.trim());
    let relative: PathBuf = if raw.is_absolute() {
        raw.strip_prefix(root).ok()?.to_path_buf()
    } else {
        raw.to_path_buf()
    };

    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Paths the executor may never modify: every authoritative document, the
/// design and state directories, and anything outside the project root.
#[derive(Debug, Clone)]
pub struct ForbiddenPaths {
    root: PathBuf,
    files: BTreeSet<String>,
    dirs: Vec<String>,
}

impl ForbiddenPaths {
    pub fn new<F, D>(root: &Path, files: F, dirs: D) -> Self
    where
        F: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
    {
        let files = files
            .into_iter()
            .filter_map(|file| normalize_relative(root, &file))
            .collect();
        let dirs = dirs
            .into_iter()
            .filter_map(|dir| normalize_relative(root, &dir))
            .collect();
        Self {
            root: root.to_path_buf(),
            files,
            dirs,
        }
    }

    pub fn is_forbidden(&self, path: &str) -> bool {
        let Some(normalized) = normalize_relative(&self.root, path) else {
            return true;
        };
        self.files.contains(&normalized)
            || self.dirs.iter().any(|dir| {
                normalized == *dir
                    || normalized
                        .strip_prefix(dir.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }

    /// Forbidden entries of `changed`, in input order.
    pub fn violations<'a>(&self, changed: &'a [String]) -> Vec<&'a str> {
        changed
            .iter()
            .map(String::as_str)
            .filter(|path| self.is_forbidden(path))
            .collect()
    }
}
