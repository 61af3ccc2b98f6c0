//! `shepherd init` scaffolding.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::io::config::{ShepherdConfig, write_config};
use crate::io::paths::ShepherdPaths;
use crate::io::summary::SUMMARY_HEADER;

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite existing config, goals, and manifest. The ledger is never touched.
    pub force: bool,
}

/// Create the state and design directories with placeholder control files.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ShepherdPaths> {
    let config = ShepherdConfig::default();
    let paths = ShepherdPaths::new(root, &config.paths);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "shepherd init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "shepherd init: {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.design_dir)?;
    write_config(&paths.config_path, &config)?;
    write_file(&paths.goals_path, GOALS_PLACEHOLDER)?;
    write_file(&paths.sources_path, SOURCES_PLACEHOLDER)?;
    if !paths.summary_path.exists() {
        write_file(&paths.summary_path, SUMMARY_HEADER)?;
    }
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const GOALS_PLACEHOLDER: &str =
    "# Goals\n\nDescribe the project goals here. This file is immutable while shepherd runs.\n";
const SOURCES_PLACEHOLDER: &str = "{\n  \"sources\": []\n}\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions::default()).expect("init");
        assert!(paths.design_dir.is_dir());
        assert_eq!(load_config(&paths.config_path).expect("config"), ShepherdConfig::default());
        assert_eq!(
            fs::read_to_string(&paths.summary_path).expect("summary"),
            SUMMARY_HEADER
        );
        assert!(!paths.ledger_path.exists());
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &InitOptions::default()).expect("init");
        let err = init_project(temp.path(), &InitOptions::default()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_keeps_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions::default()).expect("init");
        fs::write(&paths.summary_path, "# Execution Summary\n\nhistory\n").expect("write");
        init_project(temp.path(), &InitOptions { force: true }).expect("force init");
        assert!(
            fs::read_to_string(&paths.summary_path)
                .expect("summary")
                .contains("history")
        );
    }
}
