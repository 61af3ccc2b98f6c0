//! Deterministic orchestration daemon.
//!
//! Shepherd drives an external planner and an external executor through a
//! plan derived from authoritative documents, one task at a time, and halts
//! with a recorded reason whenever it cannot proceed safely. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (ledger replay, plan review,
//!   selection, stop evaluation, result validation). No I/O.
//! - **[`io`]**: Side-effecting operations (state files, authority documents,
//!   collaborator processes, locking, the summary log).
//!
//! Orchestration modules ([`start`], [`dispatch`], [`validate`], [`status`],
//! [`clear`]) coordinate core logic with I/O to implement CLI commands.

pub mod clear;
pub mod core;
pub mod dispatch;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod start;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
