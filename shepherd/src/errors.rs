//! Error taxonomy for the daemon.
//!
//! Plumbing code returns `anyhow::Result` with context; the variants below are
//! attached at the point where a failure acquires policy meaning, and the CLI
//! recovers them from the error chain with [`classify`] to pick an exit code.

use thiserror::Error;

use crate::core::types::StopTrigger;

#[derive(Debug, Error)]
pub enum ShepherdError {
    /// Missing, unreadable, or invalid authority/config files. Fatal, never retried.
    #[error("authority error: {0}")]
    Authority(String),

    /// An immutable file changed since the last successful run start.
    #[error("authority error (tampered): {}", files.join(", "))]
    Tampered { files: Vec<String> },

    /// Unparseable persisted state or a violated invariant. Requires manual repair.
    #[error("state corrupt: {0}")]
    StateCorrupt(String),

    /// A second dispatch (or a second daemon) while one is in flight.
    #[error("concurrency violation: {0}")]
    Concurrency(String),

    /// Malformed, stale, or policy-violating executor result. Counted as a failed attempt.
    #[error("schema error: {0}")]
    Schema(String),

    /// Executor exceeded its wall-clock budget. Counted as a failed attempt.
    #[error("executor timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// A stop record is open; nothing may transition until it is cleared.
    #[error("stopped by {trigger} (stop #{seq}): {reason}")]
    Stop {
        seq: u64,
        trigger: StopTrigger,
        reason: String,
    },
}

impl ShepherdError {
    /// True for errors that abort the process with the fatal exit code.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authority(_)
                | Self::Tampered { .. }
                | Self::StateCorrupt(_)
                | Self::Concurrency(_)
        )
    }
}

/// Find the first [`ShepherdError`] in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&ShepherdError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ShepherdError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_error_behind_context() {
        let err = Err::<(), _>(ShepherdError::StateCorrupt("bad ledger".to_string()))
            .context("open state store")
            .unwrap_err();
        let found = classify(&err).expect("classified");
        assert!(found.is_fatal());
        assert!(matches!(found, ShepherdError::StateCorrupt(_)));
    }

    #[test]
    fn retryable_errors_are_not_fatal() {
        assert!(!ShepherdError::Schema("x".to_string()).is_fatal());
        assert!(!ShepherdError::Timeout { seconds: 3 }.is_fatal());
    }

    #[test]
    fn classify_returns_none_for_plain_errors() {
        let err = anyhow::anyhow!("io failure");
        assert!(classify(&err).is_none());
    }
}
