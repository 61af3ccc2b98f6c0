//! Stable exit codes for shepherd CLI commands.

/// Stopped cleanly, or idle with nothing left to dispatch.
pub const OK: i32 = 0;
/// Halted by a stop condition (a stop record exists and must be cleared).
pub const STOPPED: i32 = 1;
/// Fatal startup error: invalid or tampered authority files, corrupt state, or a
/// concurrency violation.
pub const FATAL: i32 = 2;
