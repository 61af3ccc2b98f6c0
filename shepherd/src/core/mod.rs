//! Pure, deterministic logic for the control loop (no I/O).

pub mod acceptance;
pub mod authority;
pub mod forbidden;
pub mod invariants;
pub mod ledger;
pub mod plan;
pub mod progress;
pub mod result_validator;
pub mod schema;
pub mod selector;
pub mod stop;
pub mod strict_json;
pub mod types;
