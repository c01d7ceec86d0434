//! Core types used throughout the file-merging engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Checkpoint identifier assigned by the coordinator.
pub type CheckpointId = u64;

/// Identifies one subtask of an operator.
///
/// The key is stable across job attempts, so it never carries an attempt
/// number: a restarted subtask derives the same managed directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubtaskKey {
    /// Job identifier, usually a hex string.
    pub job_id: String,
    /// Operator identifier, usually a hex string.
    pub operator_id: String,
    /// Index of this subtask within the operator.
    pub subtask_index: u32,
    /// Parallelism of the operator.
    pub parallelism: u32,
}

impl SubtaskKey {
    /// Create a new subtask key.
    pub fn new(
        job_id: impl Into<String>,
        operator_id: impl Into<String>,
        subtask_index: u32,
        parallelism: u32,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            operator_id: operator_id.into(),
            subtask_index,
            parallelism,
        }
    }

    /// Name of the managed shared-state directory for this subtask.
    ///
    /// Every character outside `[A-Za-z0-9-]` is replaced by `_`, so the
    /// name is safe on any file system and re-derived identically after a
    /// restart.
    pub fn managed_dir_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_",
            self.job_id, self.operator_id, self.subtask_index, self.parallelism
        )
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
    }
}

impl fmt::Display for SubtaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}({}/{})",
            self.job_id, self.operator_id, self.subtask_index, self.parallelism
        )
    }
}

/// Scope of checkpointed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointScope {
    /// Owned by a single checkpoint; written to the process-wide task-owned directory.
    Exclusive,
    /// May be referenced by several checkpoints; written to the subtask's shared directory.
    Shared,
}

impl fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointScope::Exclusive => write!(f, "exclusive"),
            CheckpointScope::Shared => write!(f, "shared"),
        }
    }
}
