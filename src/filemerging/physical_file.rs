//! Physical files shared by many logical segments.

use crate::fs::{AppendableFile, FileSystem};
use crate::types::{CheckpointId, CheckpointScope, SubtaskKey};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Lifecycle state of a physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalFileState {
    /// Writable; either pooled or claimed by one stream.
    Open,
    /// No further appends; deleted once unreferenced.
    Sealed,
    /// Removed from the file system.
    Deleted,
}

impl fmt::Display for PhysicalFileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalFileState::Open => write!(f, "open"),
            PhysicalFileState::Sealed => write!(f, "sealed"),
            PhysicalFileState::Deleted => write!(f, "deleted"),
        }
    }
}

/// Result of a reclamation attempt.
#[derive(Debug)]
pub(crate) enum DeleteOutcome {
    /// Still open, still referenced, or already deleted.
    NotReclaimable,
    /// Removed; `size` bytes leave the physical accounting.
    Deleted { size: u64 },
    /// The file system refused; the file stays sealed for a later retry.
    Failed(io::Error),
}

struct FileInner {
    state: PhysicalFileState,
    /// Write offset; equals the number of bytes on disk.
    size: u64,
    writer: Option<Box<dyn AppendableFile>>,
    /// Checkpoint -> number of (segment, checkpoint) associations in this file.
    refs: BTreeMap<CheckpointId, u32>,
}

/// One real file holding segments of one subtask and scope.
pub struct PhysicalFile {
    path: PathBuf,
    scope: CheckpointScope,
    owner: SubtaskKey,
    /// Files restored from outside the managed directories are never deleted.
    owned: bool,
    inner: Mutex<FileInner>,
}

impl PhysicalFile {
    /// A freshly created, empty, writable file.
    pub(crate) fn open(
        path: PathBuf,
        scope: CheckpointScope,
        owner: SubtaskKey,
        writer: Box<dyn AppendableFile>,
    ) -> Self {
        Self {
            path,
            scope,
            owner,
            owned: true,
            inner: Mutex::new(FileInner {
                state: PhysicalFileState::Open,
                size: 0,
                writer: Some(writer),
                refs: BTreeMap::new(),
            }),
        }
    }

    /// A file found through restored handles. It is never appended to.
    pub(crate) fn restored(
        path: PathBuf,
        scope: CheckpointScope,
        owner: SubtaskKey,
        owned: bool,
    ) -> Self {
        Self {
            path,
            scope,
            owner,
            owned,
            inner: Mutex::new(FileInner {
                state: PhysicalFileState::Sealed,
                size: 0,
                writer: None,
                refs: BTreeMap::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scope(&self) -> CheckpointScope {
        self.scope
    }

    pub fn owner(&self) -> &SubtaskKey {
        &self.owner
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn state(&self) -> PhysicalFileState {
        self.inner.lock().state
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Checkpoints with at least one live segment in this file.
    pub fn reference_set(&self) -> Vec<CheckpointId> {
        self.inner.lock().refs.keys().copied().collect()
    }

    pub fn is_open(&self) -> bool {
        self.state() == PhysicalFileState::Open
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == PhysicalFileState::Deleted
    }

    /// Append bytes at the current write offset.
    pub(crate) fn append(&self, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != PhysicalFileState::Open {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("physical file {} is {}", self.path.display(), inner.state),
            ));
        }
        let writer = inner.writer.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "physical file has no writer")
        })?;
        writer.append(buf)?;
        inner.size += buf.len() as u64;
        Ok(())
    }

    pub(crate) fn flush(&self) -> io::Result<()> {
        match self.inner.lock().writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Record one more segment association for `checkpoint_id`.
    pub(crate) fn add_ref(&self, checkpoint_id: CheckpointId) {
        *self.inner.lock().refs.entry(checkpoint_id).or_insert(0) += 1;
    }

    /// Drop one segment association for `checkpoint_id`.
    ///
    /// Returns true when the file became sealed and unreferenced.
    pub(crate) fn release_ref(&self, checkpoint_id: CheckpointId) -> bool {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.refs.get_mut(&checkpoint_id) {
            *count -= 1;
            if *count == 0 {
                inner.refs.remove(&checkpoint_id);
            }
        }
        inner.state == PhysicalFileState::Sealed && inner.refs.is_empty()
    }

    /// Stop accepting appends and close the writer.
    ///
    /// Returns true when the file is sealed and unreferenced.
    pub(crate) fn seal(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == PhysicalFileState::Open {
            inner.state = PhysicalFileState::Sealed;
            if let Some(writer) = inner.writer.take() {
                if let Err(e) = writer.close() {
                    warn!(path = %self.path.display(), error = %e, "Failed to close physical file");
                }
            }
        }
        inner.state == PhysicalFileState::Sealed && inner.refs.is_empty()
    }

    /// Grow the recorded size to cover `end`; returns the growth.
    pub(crate) fn extend_to(&self, end: u64) -> u64 {
        let mut inner = self.inner.lock();
        if end > inner.size {
            let delta = end - inner.size;
            inner.size = end;
            delta
        } else {
            0
        }
    }

    /// Delete the backing file if it is sealed and unreferenced.
    ///
    /// The state moves to `Deleted` at most once.
    pub(crate) fn delete_if_unreferenced(&self, fs: &dyn FileSystem) -> DeleteOutcome {
        let mut inner = self.inner.lock();
        if inner.state != PhysicalFileState::Sealed || !inner.refs.is_empty() {
            return DeleteOutcome::NotReclaimable;
        }
        if self.owned {
            match fs.delete(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %self.path.display(), "Physical file already gone");
                }
                Err(e) => return DeleteOutcome::Failed(e),
            }
        }
        inner.state = PhysicalFileState::Deleted;
        DeleteOutcome::Deleted { size: inner.size }
    }
}

impl fmt::Debug for PhysicalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PhysicalFile")
            .field("path", &self.path)
            .field("scope", &self.scope)
            .field("owner", &self.owner)
            .field("owned", &self.owned)
            .field("state", &inner.state)
            .field("size", &inner.size)
            .field("refs", &inner.refs)
            .finish()
    }
}
