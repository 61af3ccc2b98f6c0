//! Authority rules: objective traceability and immutable-file tampering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::plan::{Objective, PlanState};
use crate::core::types::DocumentRole;

/// Hex SHA-256 of file content.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeDocument {
    /// Project-relative normalized path; the document identity.
    pub path: String,
    pub role: DocumentRole,
    pub hash: String,
    pub validated_at: String,
}

/// Documents loaded at startup plus the hashes of the immutable control files
/// (goals, manifest, configuration).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthoritySet {
    documents: BTreeMap<String, AuthoritativeDocument>,
    immutable: BTreeMap<String, String>,
}

impl AuthoritySet {
    pub fn new(
        documents: impl IntoIterator<Item = AuthoritativeDocument>,
        immutable: BTreeMap<String, String>,
    ) -> Self {
        Self {
            documents: documents
                .into_iter()
                .map(|doc| (doc.path.clone(), doc))
                .collect(),
            immutable,
        }
    }

    pub fn get(&self, path: &str) -> Option<&AuthoritativeDocument> {
        self.documents.get(path)
    }

    pub fn documents(&self) -> impl Iterator<Item = &AuthoritativeDocument> {
        self.documents.values()
    }

    pub fn immutable_hashes(&self) -> &BTreeMap<String, String> {
        &self.immutable
    }

    /// Every hash the run depends on: documents and immutable files.
    pub fn all_hashes(&self) -> BTreeMap<String, String> {
        let mut hashes = self.immutable.clone();
        for doc in self.documents.values() {
            hashes.insert(doc.path.clone(), doc.hash.clone());
        }
        hashes
    }
}

/// True only if the objective names at least one source and every source is
/// a loaded document with a binding role.
pub fn validate_objective(objective: &Objective, set: &AuthoritySet) -> bool {
    !objective.sources.is_empty()
        && objective.sources.iter().all(|source| {
            set.get(source.trim_start_matches("./"))
                .is_some_and(|doc| doc.role.is_binding())
        })
}

/// Stable messages for every objective in `plan` that fails [`validate_objective`].
pub fn untraceable_objectives(plan: &PlanState, set: &AuthoritySet) -> Vec<String> {
    plan.objectives
        .iter()
        .filter(|objective| !validate_objective(objective, set))
        .map(|objective| {
            if objective.sources.is_empty() {
                return format!("objective '{}' has no document sources", objective.id);
            }
            let bad: Vec<&str> = objective
                .sources
                .iter()
                .map(String::as_str)
                .filter(|source| {
                    set.get(source.trim_start_matches("./"))
                        .is_none_or(|doc| !doc.role.is_binding())
                })
                .collect();
            format!(
                "objective '{}' cites unknown or optional sources: {}",
                objective.id,
                bad.join(", ")
            )
        })
        .collect()
}

/// Names whose hash differs between `baseline` and `current` (including
/// files that appeared or disappeared), sorted.
pub fn changed_hashes(
    baseline: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut changed: Vec<String> = baseline
        .iter()
        .filter(|(name, hash)| current.get(name.as_str()) != Some(*hash))
        .map(|(name, _)| name.clone())
        .collect();
    changed.extend(
        current
            .keys()
            .filter(|name| !baseline.contains_key(name.as_str()))
            .cloned(),
    );
    changed.sort();
    changed
}
