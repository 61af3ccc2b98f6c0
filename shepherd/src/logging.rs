//! Development-time tracing for the daemon.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG` or the configured
//!   `logging.level`, written to stderr (or `logging.log_file` when set).
//!
//! - **Summary (`io/summary`)**: The append-only `SUMMARY.md` product log in the
//!   state directory. Always written, unaffected by log levels.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with the `RUST_LOG` env var, defaulting to `warn`.
///
/// Used before configuration has been read (and by commands that never read it).
///
/// # Example
/// ```bash
/// RUST_LOG=shepherd=debug shepherd start
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// Initialize tracing from the configured level and optional log file.
///
/// `RUST_LOG` still wins when set. Returns an error only when the log file
/// cannot be opened; a subscriber that is already installed is left in place.
pub fn init_with(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("shepherd={level}")));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .compact(),
                )
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr).compact())
                .try_init();
        }
    }
    Ok(())
}
