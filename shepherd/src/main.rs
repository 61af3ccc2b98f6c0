use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use shepherd::clear::clear_stop;
use shepherd::dispatch::LoopStop;
use shepherd::errors::{ShepherdError, classify};
use shepherd::exit_codes;
use shepherd::io::clock::SystemClock;
use shepherd::io::config::PathsConfig;
use shepherd::io::init::{InitOptions, init_project};
use shepherd::io::paths::ShepherdPaths;
use shepherd::logging;
use shepherd::start::{Session, StartOutcome, record_fatal, start};
use shepherd::status::project_status;
use shepherd::validate::validate_project;

#[derive(Parser)]
#[command(
    name = "shepherd",
    version,
    about = "Deterministic orchestration daemon for planner/executor agents"
)]
struct Cli {
    /// Project root containing the state and design directories.
    #[arg(long, global = true, default_value = ".")]
    project_root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state directory with a default config and placeholder files.
    Init {
        /// Overwrite existing config, goals, and manifest.
        #[arg(short, long)]
        force: bool,
    },
    /// Validate authority, recover, and dispatch until stopped or idle.
    Start,
    /// Load config, authority documents, and state without dispatching.
    Validate,
    /// Print derived progress and any open stop as JSON.
    Status,
    /// Clear the open stop after an external intervention.
    ClearStop {
        /// What was done to resolve the stop (recorded in the ledger).
        #[arg(long)]
        note: String,
        /// Return a failed or blocked task to pending with a fresh retry budget.
        #[arg(long = "release", value_name = "TASK_ID")]
        release: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("shepherd: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<i32> {
    let root =
        std::fs::canonicalize(&cli.project_root).unwrap_or_else(|_| cli.project_root.clone());
    let root = root.as_path();
    match &cli.command {
        Command::Init { force } => {
            logging::init();
            cmd_init(root, *force)
        }
        Command::Start => cmd_start(root),
        Command::Validate => {
            logging::init();
            cmd_validate(root)
        }
        Command::Status => {
            logging::init();
            cmd_status(root)
        }
        Command::ClearStop { note, release } => {
            logging::init();
            let seq = clear_stop(root, note, release, &SystemClock)?;
            println!("cleared stop #{seq}");
            Ok(exit_codes::OK)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match classify(err) {
        Some(ShepherdError::Stop { .. }) => exit_codes::STOPPED,
        _ => exit_codes::FATAL,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_start(root: &Path) -> Result<i32> {
    let session = match Session::open(root) {
        Ok(session) => session,
        Err(err) => {
            logging::init();
            let paths = ShepherdPaths::new(root, &PathsConfig::default());
            record_fatal(&paths, &err, &SystemClock);
            return Err(err);
        }
    };
    let logging_config = &session.config.logging;
    logging::init_with(
        logging_config.level.directive(),
        logging_config
            .log_file
            .as_deref()
            .map(|file| root.join(file))
            .as_deref(),
    )?;

    let outcome = start(&session, &SystemClock, |result| {
        println!(
            "{} attempt {}: {:?}",
            result.task_id, result.attempt, result.outcome
        );
    })?;
    match outcome {
        StartOutcome::Refused(stop) => {
            eprintln!(
                "shepherd: stop #{} ({}) is open; run `shepherd clear-stop --note <text>` first",
                stop.seq, stop.trigger
            );
            Ok(exit_codes::STOPPED)
        }
        StartOutcome::Ran(outcome) => match outcome.stop {
            LoopStop::Complete => {
                println!("complete: {} task(s) dispatched", outcome.dispatched);
                Ok(exit_codes::OK)
            }
            LoopStop::Idle => {
                println!("idle: {} task(s) dispatched, waiting for a plan", outcome.dispatched);
                Ok(exit_codes::OK)
            }
            LoopStop::Stopped(record) => {
                println!(
                    "stopped #{}: {}\n{}",
                    record.seq, record.trigger, record.reason
                );
                Ok(exit_codes::STOPPED)
            }
        },
    }
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let outcome = validate_project(root, &SystemClock)?;
    if outcome.is_clean() {
        println!("ok: {} authoritative document(s)", outcome.documents);
        return Ok(exit_codes::OK);
    }
    for finding in &outcome.findings {
        println!("- {finding}");
    }
    Ok(exit_codes::STOPPED)
}

fn cmd_status(root: &Path) -> Result<i32> {
    let report = project_status(root)?;
    let rendered = serde_json::to_string_pretty(&report).context("serialize status")?;
    println!("{rendered}");
    Ok(if report.stop.is_some() {
        exit_codes::STOPPED
    } else {
        exit_codes::OK
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["shepherd", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_clear_stop_with_releases() {
        let cli = Cli::parse_from([
            "shepherd",
            "--project-root",
            "/tmp/p",
            "clear-stop",
            "--note",
            "fixed docs",
            "--release",
            "t1",
            "--release",
            "t2",
        ]);
        assert_eq!(cli.project_root, PathBuf::from("/tmp/p"));
        match cli.command {
            Command::ClearStop { note, release } => {
                assert_eq!(note, "fixed docs");
                assert_eq!(release, vec!["t1".to_string(), "t2".to_string()]);
            }
            _ => panic!("expected clear-stop"),
        }
    }

    #[test]
    fn clear_stop_requires_note() {
        assert!(Cli::try_parse_from(["shepherd", "clear-stop"]).is_err());
    }

    #[test]
    fn stop_errors_map_to_stopped_code() {
        let stop = anyhow::Error::new(ShepherdError::Stop {
            seq: 1,
            trigger: shepherd::core::types::StopTrigger::PlanInvalid,
            reason: "x".to_string(),
        });
        assert_eq!(exit_code_for(&stop), exit_codes::STOPPED);
        let corrupt = anyhow::Error::new(ShepherdError::StateCorrupt("x".to_string()));
        assert_eq!(exit_code_for(&corrupt), exit_codes::FATAL);
    }
}
