//! Logical segments and the handles given out for them.

use super::physical_file::PhysicalFile;
use crate::error::Result;
use crate::types::{CheckpointId, CheckpointScope, SubtaskKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Handle to one segment of a physical file.
///
/// Anyone with access to the file system can read the segment back from
/// `file_path` at `[offset, offset + length)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentHandle {
    pub file_path: PathBuf,
    pub offset: u64,
    pub length: u64,
    pub scope: CheckpointScope,
}

impl SegmentHandle {
    pub fn new(file_path: impl Into<PathBuf>, offset: u64, length: u64, scope: CheckpointScope) -> Self {
        Self {
            file_path: file_path.into(),
            offset,
            length,
            scope,
        }
    }

    /// End offset (exclusive) of the segment. Saturates for corrupt handles.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// End offset (exclusive), `None` if `offset + length` overflows.
    pub fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub(crate) fn key(&self) -> SegmentKey {
        SegmentKey {
            path: self.file_path.clone(),
            offset: self.offset,
        }
    }

    /// Serialize the handle for checkpoint metadata.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a handle written by [`SegmentHandle::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for SegmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, +{}]",
            self.file_path.display(),
            self.offset,
            self.length
        )
    }
}

/// Snapshot of a managed directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryHandle {
    pub path: PathBuf,
    pub scope: CheckpointScope,
}

impl DirectoryHandle {
    pub fn new(path: impl Into<PathBuf>, scope: CheckpointScope) -> Self {
        Self {
            path: path.into(),
            scope,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Segments never overlap, so the start offset identifies one within a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SegmentKey {
    pub path: PathBuf,
    pub offset: u64,
}

#[derive(Debug)]
struct SegmentRefs {
    checkpoints: BTreeSet<CheckpointId>,
    released: bool,
}

/// One state handle's byte range inside a physical file.
///
/// Each referencing checkpoint holds one reference on the physical file.
/// When the last checkpoint lets go the segment is released for good.
#[derive(Debug)]
pub struct LogicalSegment {
    file: Arc<PhysicalFile>,
    offset: u64,
    length: u64,
    checkpoint_id: CheckpointId,
    subtask: SubtaskKey,
    refs: Mutex<SegmentRefs>,
}

impl LogicalSegment {
    /// Create a segment referenced by `checkpoint_id` and take its file reference.
    pub(crate) fn new(
        file: Arc<PhysicalFile>,
        offset: u64,
        length: u64,
        checkpoint_id: CheckpointId,
        subtask: SubtaskKey,
    ) -> Self {
        file.add_ref(checkpoint_id);
        Self {
            file,
            offset,
            length,
            checkpoint_id,
            subtask,
            refs: Mutex::new(SegmentRefs {
                checkpoints: BTreeSet::from([checkpoint_id]),
                released: false,
            }),
        }
    }

    pub fn file(&self) -> &Arc<PhysicalFile> {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Checkpoint the segment was written (or restored) for.
    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn subtask(&self) -> &SubtaskKey {
        &self.subtask
    }

    pub fn scope(&self) -> CheckpointScope {
        self.file.scope()
    }

    pub fn handle(&self) -> SegmentHandle {
        SegmentHandle::new(self.file.path(), self.offset, self.length, self.scope())
    }

    pub(crate) fn key(&self) -> SegmentKey {
        SegmentKey {
            path: self.file.path().to_path_buf(),
            offset: self.offset,
        }
    }

    /// Checkpoints currently referencing the segment.
    pub fn checkpoints(&self) -> Vec<CheckpointId> {
        self.refs.lock().checkpoints.iter().copied().collect()
    }

    pub fn is_released(&self) -> bool {
        self.refs.lock().released
    }

    /// Add a referencing checkpoint.
    ///
    /// Returns false if the segment is released or already referenced by it.
    pub(crate) fn attach(&self, checkpoint_id: CheckpointId) -> bool {
        let mut refs = self.refs.lock();
        if refs.released || !refs.checkpoints.insert(checkpoint_id) {
            return false;
        }
        self.file.add_ref(checkpoint_id);
        true
    }

    /// Remove a referencing checkpoint.
    pub(crate) fn detach(&self, checkpoint_id: CheckpointId) -> Detached {
        let mut refs = self.refs.lock();
        if !refs.checkpoints.remove(&checkpoint_id) {
            return Detached::NotReferenced;
        }
        let file_reclaimable = self.file.release_ref(checkpoint_id);
        if refs.checkpoints.is_empty() {
            refs.released = true;
        }
        Detached::Removed {
            segment_released: refs.released,
            file_reclaimable,
        }
    }
}

/// Outcome of [`LogicalSegment::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detached {
    NotReferenced,
    Removed {
        segment_released: bool,
        file_reclaimable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restored_file() -> Arc<PhysicalFile> {
        Arc::new(PhysicalFile::restored(
            PathBuf::from("/shared/f"),
            CheckpointScope::Shared,
            SubtaskKey::new("job", "op", 0, 1),
            true,
        ))
    }

    #[test]
    fn test_handle_bytes() {
        let handle = SegmentHandle::new("/shared/f", 10, 20, CheckpointScope::Shared);
        let bytes = handle.to_bytes().unwrap();
        assert_eq!(SegmentHandle::from_bytes(&bytes).unwrap(), handle);
        assert_eq!(handle.end(), 30);
        assert!(SegmentHandle::from_bytes(&[1, 2]).is_err());
    }

    #[test]
    fn test_attach_and_detach() {
        let file = restored_file();
        let segment = LogicalSegment::new(file.clone(), 0, 10, 1, SubtaskKey::new("job", "op", 0, 1));
        assert_eq!(file.reference_set(), vec![1]);

        assert!(segment.attach(2));
        assert!(!segment.attach(2));
        assert_eq!(file.reference_set(), vec![1, 2]);

        assert_eq!(
            segment.detach(1),
            Detached::Removed {
                segment_released: false,
                file_reclaimable: false
            }
        );
        assert_eq!(segment.detach(1), Detached::NotReferenced);

        assert_eq!(
            segment.detach(2),
            Detached::Removed {
                segment_released: true,
                file_reclaimable: true
            }
        );
        assert!(segment.is_released());
        assert!(!segment.attach(3));
        assert!(file.reference_set().is_empty());
    }

    #[test]
    fn test_handle_matches_segment() {
        let file = restored_file();
        let segment = LogicalSegment::new(file, 5, 7, 3, SubtaskKey::new("job", "op", 0, 1));
        let handle = segment.handle();
        assert_eq!(handle.offset, 5);
        assert_eq!(handle.length, 7);
        assert_eq!(handle.key(), segment.key());
    }
}
