//! Side-effecting operations: filesystem state, collaborator processes, locking.

pub mod atomic;
pub mod authority;
pub mod clock;
pub mod config;
pub mod executor;
pub mod init;
pub mod lock;
pub mod paths;
pub mod planner;
pub mod process;
pub mod state_store;
pub mod summary;
