//! Canonical file locations for a project root.

use std::path::{Path, PathBuf};

use crate::io::config::PathsConfig;

/// The config file is always read from here, before `paths.state_dir` is known.
pub const BOOTSTRAP_STATE_DIR: &str = "ai";
pub const DEFAULT_DESIGN_DIR: &str = "design";

pub const CONFIG_FILENAME: &str = "config.json";
pub const GOALS_FILENAME: &str = "GOALS.md";
pub const SOURCES_FILENAME: &str = "SOURCES.yaml";
pub const LEDGER_FILENAME: &str = "LEDGER.json";
pub const PLAN_FILENAME: &str = "PLAN.yaml";
pub const PROGRESS_FILENAME: &str = "PROGRESS.yaml";
pub const ACTIVE_TASK_FILENAME: &str = "ACTIVE_TASK.yaml";
pub const LAST_RESULT_FILENAME: &str = "LAST_RESULT.json";
pub const SUMMARY_FILENAME: &str = "SUMMARY.md";
pub const PROPOSAL_FILENAME: &str = "PLAN_PROPOSAL.json";
pub const LOCK_FILENAME: &str = ".shepherd.lock";

#[derive(Debug, Clone)]
pub struct ShepherdPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub design_dir: PathBuf,
    pub config_path: PathBuf,
    pub goals_path: PathBuf,
    pub sources_path: PathBuf,
    pub ledger_path: PathBuf,
    pub plan_path: PathBuf,
    pub progress_path: PathBuf,
    pub active_task_path: PathBuf,
    pub last_result_path: PathBuf,
    pub summary_path: PathBuf,
    pub proposal_path: PathBuf,
    pub lock_path: PathBuf,
}

impl ShepherdPaths {
    pub fn bootstrap_config(root: &Path) -> PathBuf {
        root.join(BOOTSTRAP_STATE_DIR).join(CONFIG_FILENAME)
    }

    pub fn new(root: impl Into<PathBuf>, dirs: &PathsConfig) -> Self {
        let root = root.into();
        let state_dir = root.join(&dirs.state_dir);
        let design_dir = root.join(&dirs.design_dir);
        Self {
            config_path: Self::bootstrap_config(&root),
            goals_path: state_dir.join(GOALS_FILENAME),
            sources_path: state_dir.join(SOURCES_FILENAME),
            ledger_path: state_dir.join(LEDGER_FILENAME),
            plan_path: state_dir.join(PLAN_FILENAME),
            progress_path: state_dir.join(PROGRESS_FILENAME),
            active_task_path: state_dir.join(ACTIVE_TASK_FILENAME),
            last_result_path: state_dir.join(LAST_RESULT_FILENAME),
            summary_path: state_dir.join(SUMMARY_FILENAME),
            proposal_path: state_dir.join(PROPOSAL_FILENAME),
            lock_path: state_dir.join(LOCK_FILENAME),
            root,
            state_dir,
            design_dir,
        }
    }

    /// Root-relative display form (`ai/config.json`), falling back to the full path.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_stays_in_bootstrap_dir() {
        let dirs = PathsConfig {
            design_dir: "architecture".to_string(),
            state_dir: "state".to_string(),
        };
        let paths = ShepherdPaths::new("/p", &dirs);
        assert_eq!(paths.config_path, Path::new("/p/ai/config.json"));
        assert_eq!(paths.ledger_path, Path::new("/p/state/LEDGER.json"));
        assert_eq!(paths.design_dir, Path::new("/p/architecture"));
        assert_eq!(paths.relative(&paths.goals_path), "state/GOALS.md");
    }
}
