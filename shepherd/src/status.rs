//! `shepherd status`: derived progress and any open stop, read-only.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::core::progress::ProgressState;
use crate::core::types::{ActiveTask, StopRecord, TaskResult};
use crate::io::state_store::StateStore;
use crate::start::Session;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub progress: ProgressState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopRecord>,
}

pub fn project_status(root: &Path) -> Result<StatusReport> {
    let session = Session::open(root)?;
    let store = StateStore::open(&session.paths)?;
    let (_, progress, active) = store.load();
    Ok(StatusReport {
        progress,
        active,
        last_result: store.view().last_result().cloned(),
        stop: store.open_stop().cloned(),
    })
}
