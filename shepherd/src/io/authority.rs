//! Authority store: loads the source manifest and hashes every document.
//!
//! Read-only. Nothing in this module writes to the project.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::authority::{AuthoritativeDocument, AuthoritySet, changed_hashes, content_hash};
use crate::core::forbidden::{ForbiddenPaths, normalize_relative};
use crate::core::strict_json::{from_strict_str, parse_strict};
use crate::core::types::DocumentRole;
use crate::errors::ShepherdError;
use crate::io::clock::Clock;
use crate::io::paths::ShepherdPaths;

/// `SOURCES.yaml` (JSON subset).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceManifest {
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceEntry {
    path: String,
    role: DocumentRole,
}

const MISSING: &str = "missing";

/// Load the immutable files and every manifest document.
///
/// Any missing, unreadable, or malformed file is an [`ShepherdError::Authority`].
pub fn load_authority(paths: &ShepherdPaths, clock: &dyn Clock) -> Result<AuthoritySet> {
    let mut immutable = BTreeMap::new();
    for path in [&paths.config_path, &paths.goals_path, &paths.sources_path] {
        let bytes = read_required(path)?;
        immutable.insert(paths.relative(path), content_hash(&bytes));
    }

    let raw = String::from_utf8(read_required(&paths.sources_path)?).map_err(|err| {
        ShepherdError::Authority(format!("{} is not UTF-8: {err}", paths.sources_path.display()))
    })?;
    let manifest: SourceManifest = from_strict_str(&raw).map_err(|err| {
        ShepherdError::Authority(format!("parse {}: {err}", paths.sources_path.display()))
    })?;
    if manifest.sources.is_empty() {
        warn!("source manifest lists no documents; no objective can be traced");
    }

    let validated_at = clock.timestamp();
    let mut seen = BTreeSet::new();
    let mut documents = Vec::with_capacity(manifest.sources.len());
    for entry in manifest.sources {
        let relative = normalize_relative(&paths.root, &entry.path).ok_or_else(|| {
            ShepherdError::Authority(format!(
                "source '{}' does not name a file inside the project",
                entry.path
            ))
        })?;
        if !seen.insert(relative.clone()) {
            return Err(
                ShepherdError::Authority(format!("source '{relative}' listed twice")).into(),
            );
        }
        let path = paths.root.join(&relative);
        let bytes = read_required(&path)?;
        if is_structured(&relative) {
            let text = String::from_utf8_lossy(&bytes);
            parse_strict(&text).map_err(|err| {
                ShepherdError::Authority(format!(
                    "source '{relative}' is not valid JSON-subset data: {err}"
                ))
            })?;
        }
        debug!(path = %relative, role = ?entry.role, "loaded authoritative document");
        documents.push(AuthoritativeDocument {
            hash: content_hash(&bytes),
            path: relative,
            role: entry.role,
            validated_at: validated_at.clone(),
        });
    }

    info!(documents = documents.len(), "authority store loaded");
    Ok(AuthoritySet::new(documents, immutable))
}

/// Re-hash everything the set was loaded from and list what changed.
pub fn detect_changes(paths: &ShepherdPaths, set: &AuthoritySet) -> Vec<String> {
    let baseline = set.all_hashes();
    let current = baseline
        .keys()
        .map(|name| {
            let hash = fs::read(paths.root.join(name))
                .map(|bytes| content_hash(&bytes))
                .unwrap_or_else(|_| MISSING.to_string());
            (name.clone(), hash)
        })
        .collect();
    changed_hashes(&baseline, &current)
}

/// Paths an executor may never report as changed: every loaded document,
/// the immutable files, and the state and design directories.
pub fn forbidden_paths(paths: &ShepherdPaths, set: &AuthoritySet) -> ForbiddenPaths {
    ForbiddenPaths::new(
        &paths.root,
        set.all_hashes().into_keys(),
        [paths.relative(&paths.state_dir), paths.relative(&paths.design_dir)],
    )
}

/// Compare the loaded immutable files against the baseline from the last run start.
pub fn check_tampering(baseline: &BTreeMap<String, String>, set: &AuthoritySet) -> Result<()> {
    let files = changed_hashes(baseline, set.immutable_hashes());
    if files.is_empty() {
        return Ok(());
    }
    Err(ShepherdError::Tampered { files }.into())
}

fn read_required(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|err| {
        ShepherdError::Authority(format!("read {}: {err}", path.display())).into()
    })
}

fn is_structured(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    [".json", ".yaml", ".yml"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}
