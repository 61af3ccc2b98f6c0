//! Exclusive daemon lock on the state directory.

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

use crate::errors::ShepherdError;

/// Held for the life of a run; the OS releases it when the file is closed,
/// including on crash.
#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl StateLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        file.try_lock_exclusive().map_err(|err| {
            ShepherdError::Concurrency(format!(
                "another shepherd holds {} ({err})",
                path.display()
            ))
        })?;
        debug!(path = %path.display(), "state lock acquired");
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::classify;

    #[test]
    fn second_lock_is_a_concurrency_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ai").join(".shepherd.lock");
        let first = StateLock::acquire(&path).expect("first lock");
        let err = StateLock::acquire(&path).unwrap_err();
        assert!(matches!(classify(&err), Some(ShepherdError::Concurrency(_))));
        drop(first);
        StateLock::acquire(&path).expect("lock after release");
    }
}
