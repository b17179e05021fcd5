//! Filesystem inspection: an immutable view of the commit-log file set taken
//! once, before any bootstrapping.

use crate::commitlog::list_commit_log_files;
use crate::error::BootstrapError;
use std::collections::HashSet;
use std::path::Path;

/// The set of commit-log filenames present at startup.
///
/// Commit-log files created after this capture belong to the running process;
/// their contents are already in the live in-memory buffers and must never be
/// replayed.
#[derive(Debug, Clone, Default)]
pub struct FilesystemInspection {
    commitlog_files: HashSet<String>,
}

impl FilesystemInspection {
    /// Captures the commit-log file set under `prefix`.
    pub fn capture(prefix: &Path) -> Result<Self, BootstrapError> {
        let files = list_commit_log_files(prefix)?;
        Ok(Self {
            commitlog_files: files.into_iter().map(|f| f.name).collect(),
        })
    }

    pub fn commitlog_files_set(&self) -> &HashSet<String> {
        &self.commitlog_files
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commitlog_files.contains(name)
    }
}
