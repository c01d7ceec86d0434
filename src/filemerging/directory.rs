//! Managed directory layout.
//!
//! ```text
//! <checkpoint base dir>/
//!     shared/
//!         <job>_<operator>_<index>_<parallelism>_/   shared state, one per subtask
//!     taskowned/                                     exclusive state, process-wide
//!     chk-<id>/                                      checkpoint metadata, not managed here
//! ```

use super::segment::DirectoryHandle;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::types::{CheckpointScope, SubtaskKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Directories and file system fixed by `init_file_system`.
#[derive(Debug)]
pub(crate) struct FsLayout {
    pub fs: Arc<dyn FileSystem>,
    pub base_dir: PathBuf,
    pub shared_dir: PathBuf,
    pub task_owned_dir: PathBuf,
    pub write_buffer_size: usize,
}

/// Creates and hands out the managed directories.
#[derive(Debug)]
pub struct DirectoryManager {
    default_write_buffer_size: usize,
    layout: RwLock<Option<Arc<FsLayout>>>,
    shared_dirs: DashMap<SubtaskKey, PathBuf>,
}

impl DirectoryManager {
    pub fn new(default_write_buffer_size: usize) -> Self {
        Self {
            default_write_buffer_size,
            layout: RwLock::new(None),
            shared_dirs: DashMap::new(),
        }
    }

    /// Fix the file system and directory layout for the lifetime of the process.
    ///
    /// Repeating the call with the same paths is a no-op. Any changed path
    /// fails with [`Error::ConfigurationConflict`].
    pub fn init_file_system(
        &self,
        fs: Arc<dyn FileSystem>,
        base_dir: &Path,
        shared_dir: &Path,
        task_owned_dir: &Path,
        write_buffer_size: usize,
    ) -> Result<()> {
        if let Some(existing) = self.layout.read().as_ref() {
            return Self::check_same_layout(existing, base_dir, shared_dir, task_owned_dir);
        }

        let mut layout = self.layout.write();
        if let Some(existing) = layout.as_ref() {
            return Self::check_same_layout(existing, base_dir, shared_dir, task_owned_dir);
        }

        fs.mkdirs(shared_dir)?;
        fs.mkdirs(task_owned_dir)?;

        let write_buffer_size = if write_buffer_size == 0 {
            self.default_write_buffer_size
        } else {
            write_buffer_size
        };

        info!(
            base_dir = %base_dir.display(),
            shared_dir = %shared_dir.display(),
            task_owned_dir = %task_owned_dir.display(),
            write_buffer_size,
            "File system initialized for file merging"
        );

        *layout = Some(Arc::new(FsLayout {
            fs,
            base_dir: base_dir.to_path_buf(),
            shared_dir: shared_dir.to_path_buf(),
            task_owned_dir: task_owned_dir.to_path_buf(),
            write_buffer_size,
        }));
        Ok(())
    }

    fn check_same_layout(
        existing: &FsLayout,
        base_dir: &Path,
        shared_dir: &Path,
        task_owned_dir: &Path,
    ) -> Result<()> {
        if existing.base_dir != base_dir {
            return Err(Error::conflict("base_dir", &existing.base_dir, base_dir));
        }
        if existing.shared_dir != shared_dir {
            return Err(Error::conflict("shared_dir", &existing.shared_dir, shared_dir));
        }
        if existing.task_owned_dir != task_owned_dir {
            return Err(Error::conflict(
                "task_owned_dir",
                &existing.task_owned_dir,
                task_owned_dir,
            ));
        }
        debug!(base_dir = %base_dir.display(), "File system already initialized");
        Ok(())
    }

    pub(crate) fn layout(&self) -> Result<Arc<FsLayout>> {
        self.layout.read().clone().ok_or(Error::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.layout.read().is_some()
    }

    pub fn file_system(&self) -> Result<Arc<dyn FileSystem>> {
        Ok(self.layout()?.fs.clone())
    }

    /// Buffer size for segment streams; the configured default before initialization.
    pub fn write_buffer_size(&self) -> usize {
        self.layout
            .read()
            .as_ref()
            .map(|l| l.write_buffer_size)
            .unwrap_or(self.default_write_buffer_size)
    }

    /// Create the shared-state directory of a subtask if it does not exist.
    pub fn register_subtask_for_shared_states(&self, subtask: &SubtaskKey) -> Result<()> {
        let layout = self.layout()?;
        if self.shared_dirs.contains_key(subtask) {
            return Ok(());
        }

        // mkdirs is idempotent; racing registrations may both create the dir.
        let dir = layout.shared_dir.join(subtask.managed_dir_name());
        layout.fs.mkdirs(&dir)?;
        if let Entry::Vacant(entry) = self.shared_dirs.entry(subtask.clone()) {
            info!(%subtask, dir = %dir.display(), "Registered subtask for shared states");
            entry.insert(dir);
        }
        Ok(())
    }

    /// Forget the subtask's shared directory. Returns whether it was registered.
    ///
    /// Files inside the directory are left alone; they are deleted once the
    /// checkpoints referencing them are released.
    pub fn unregister_subtask(&self, subtask: &SubtaskKey) -> bool {
        let removed = self.shared_dirs.remove(subtask).is_some();
        if removed {
            info!(%subtask, "Unregistered subtask");
        }
        removed
    }

    pub fn is_registered(&self, subtask: &SubtaskKey) -> bool {
        self.shared_dirs.contains_key(subtask)
    }

    /// Managed directory of a subtask for a scope.
    pub fn managed_dir(&self, subtask: &SubtaskKey, scope: CheckpointScope) -> Result<PathBuf> {
        match scope {
            CheckpointScope::Exclusive => Ok(self.layout()?.task_owned_dir.clone()),
            CheckpointScope::Shared => self
                .shared_dirs
                .get(subtask)
                .map(|dir| dir.value().clone())
                .ok_or_else(|| Error::NotRegistered {
                    subtask: subtask.clone(),
                    scope,
                }),
        }
    }

    /// [`DirectoryHandle`] snapshot of a managed directory.
    pub fn managed_dir_handle(
        &self,
        subtask: &SubtaskKey,
        scope: CheckpointScope,
    ) -> Result<DirectoryHandle> {
        Ok(DirectoryHandle::new(self.managed_dir(subtask, scope)?, scope))
    }

    /// Where the subtask's files of `scope` live, registered or not.
    pub(crate) fn expected_dir(&self, subtask: &SubtaskKey, scope: CheckpointScope) -> Result<PathBuf> {
        let layout = self.layout()?;
        Ok(match scope {
            CheckpointScope::Exclusive => layout.task_owned_dir.clone(),
            CheckpointScope::Shared => layout.shared_dir.join(subtask.managed_dir_name()),
        })
    }
}
