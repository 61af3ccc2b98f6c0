//! Daemon configuration stored in `ai/config.json`.
//!
//! The file is immutable for the daemon: it is read and hashed at startup and
//! never rewritten outside `shepherd init`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::forbidden::normalize_relative;
use crate::core::stop::Limits;
use crate::core::strict_json::from_strict_str;
use crate::errors::ShepherdError;
use crate::io::atomic::write_atomic;
use crate::io::paths::{BOOTSTRAP_STATE_DIR, DEFAULT_DESIGN_DIR};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShepherdConfig {
    pub mcp: McpConfig,
    pub execution: ExecutionConfig,
    pub paths: PathsConfig,
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// External planner process. Without it plans are read from the inbox file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner: Option<PlannerConfig>,
}

/// A command given either as one whitespace-separated string or as argv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Self::Argv(argv) => argv.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.argv().first().is_none_or(|program| program.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpConfig {
    /// Executor command, spawned once per task.
    pub command: CommandLine,
    pub startup_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    pub task_timeout_seconds: u64,
    pub max_retries_per_task: u32,
    pub max_consecutive_failures: u32,
    pub one_task_at_a_time: bool,
    /// Truncate captured collaborator stdout/stderr beyond this many bytes.
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
}

fn default_output_limit() -> usize {
    1_000_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub design_dir: String,
    pub state_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            design_dir: DEFAULT_DESIGN_DIR.to_string(),
            state_dir: BOOTSTRAP_STATE_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Reject executor replies with unknown keys (otherwise they are dropped).
    pub strict_schema_validation: bool,
    pub json_subset_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// `tracing` filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Project-relative file that receives developer logs instead of stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerConfig {
    pub command: CommandLine,
    /// Defaults to `mcp.startup_timeout_seconds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        Self {
            mcp: McpConfig {
                command: CommandLine::Line("python3 tools/mcp_stub.py".to_string()),
                startup_timeout_seconds: 30,
            },
            execution: ExecutionConfig {
                task_timeout_seconds: 30 * 60,
                max_retries_per_task: 2,
                max_consecutive_failures: 3,
                one_task_at_a_time: true,
                output_limit_bytes: default_output_limit(),
            },
            paths: PathsConfig::default(),
            validation: ValidationConfig {
                strict_schema_validation: true,
                json_subset_only: true,
            },
            logging: LoggingConfig::default(),
            planner: None,
        }
    }
}

impl ShepherdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mcp.command.is_empty() {
            return Err(anyhow!("mcp.command must be non-empty"));
        }
        if self.execution.task_timeout_seconds == 0 {
            return Err(anyhow!("execution.task_timeout_seconds must be > 0"));
        }
        if self.execution.max_consecutive_failures == 0 {
            return Err(anyhow!("execution.max_consecutive_failures must be > 0"));
        }
        if !self.execution.one_task_at_a_time {
            return Err(anyhow!("execution.one_task_at_a_time must be true"));
        }
        if self.execution.output_limit_bytes == 0 {
            return Err(anyhow!("execution.output_limit_bytes must be > 0"));
        }
        if !self.validation.json_subset_only {
            return Err(anyhow!("validation.json_subset_only must be true"));
        }
        let root = Path::new("");
        let design = normalize_relative(root, &self.paths.design_dir)
            .ok_or_else(|| anyhow!("paths.design_dir must be a directory inside the project"))?;
        let state = normalize_relative(root, &self.paths.state_dir)
            .ok_or_else(|| anyhow!("paths.state_dir must be a directory inside the project"))?;
        if design == state {
            return Err(anyhow!("paths.design_dir and paths.state_dir must differ"));
        }
        if let Some(planner) = &self.planner {
            if planner.command.is_empty() {
                return Err(anyhow!("planner.command must be non-empty"));
            }
            if planner.timeout_seconds == Some(0) {
                return Err(anyhow!("planner.timeout_seconds must be > 0"));
            }
        }
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_retries_per_task: self.execution.max_retries_per_task,
            max_consecutive_failures: self.execution.max_consecutive_failures,
        }
    }

    pub fn planner_timeout_seconds(&self) -> u64 {
        self.planner
            .as_ref()
            .and_then(|planner| planner.timeout_seconds)
            .unwrap_or(self.mcp.startup_timeout_seconds)
    }
}

/// Load and validate config. Every failure is an authority error.
pub fn load_config(path: &Path) -> Result<ShepherdConfig> {
    let contents = fs::read_to_string(path)
        .map_err(|err| ShepherdError::Authority(format!("read {}: {err}", path.display())))?;
    let cfg: ShepherdConfig = from_strict_str(&contents)
        .map_err(|err| ShepherdError::Authority(format!("parse {}: {err}", path.display())))?;
    cfg.validate()
        .map_err(|err| ShepherdError::Authority(format!("{}: {err}", path.display())))?;
    Ok(cfg)
}

pub fn write_config(path: &Path, cfg: &ShepherdConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = serde_json::to_string_pretty(cfg).context("serialize config")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::classify;

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        let cfg = ShepherdConfig::default();
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn missing_config_is_an_authority_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_config(&temp.path().join("config.json")).unwrap_err();
        assert!(matches!(classify(&err), Some(ShepherdError::Authority(_))));
    }

    #[test]
    fn rejects_duplicate_keys_and_unknown_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        let mut value = serde_json::to_value(ShepherdConfig::default()).expect("to value");
        value["execution"]["parallel"] = serde_json::json!(true);
        fs::write(&path, value.to_string()).expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("unknown field `parallel`"));

        fs::write(&path, r#"{"mcp": {}, "mcp": {}}"#).expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate key `mcp`"));
    }

    #[test]
    fn validate_enforces_single_task_and_json_subset() {
        let mut cfg = ShepherdConfig::default();
        cfg.execution.one_task_at_a_time = false;
        assert!(cfg.validate().is_err());

        let mut cfg = ShepherdConfig::default();
        cfg.validation.json_subset_only = false;
        assert!(cfg.validate().is_err());

        let mut cfg = ShepherdConfig::default();
        cfg.paths.state_dir = "../elsewhere".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = ShepherdConfig::default();
        cfg.paths.state_dir = "design/".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn command_accepts_line_or_argv() {
        let line: CommandLine = serde_json::from_str(r#""python3  tools/stub.py --x""#).expect("line");
        assert_eq!(line.argv(), vec!["python3", "tools/stub.py", "--x"]);
        let argv: CommandLine = serde_json::from_str(r#"["sh", "-c", "echo hi"]"#).expect("argv");
        assert_eq!(argv.argv(), vec!["sh", "-c", "echo hi"]);
        assert!(CommandLine::Line("   ".to_string()).is_empty());
    }

    #[test]
    fn warning_and_critical_map_to_tracing_levels() {
        assert_eq!(LogLevel::Warning.directive(), "warn");
        assert_eq!(LogLevel::Critical.directive(), "error");
        let logging: LoggingConfig =
            serde_json::from_str(r#"{"level": "warning", "log_file": "ai/shepherd.log"}"#).expect("parse");
        assert_eq!(logging.level, LogLevel::Warning);
    }
}
