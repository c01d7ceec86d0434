//! Testing utilities for the file-merging engine.
//!
//! This module provides:
//! - [`InMemoryFileSystem`], a [`FileSystem`](crate::fs::FileSystem) kept in
//!   memory that can inject failures
//! - [`FailpointRegistry`] to control where failures happen
//! - [`TestEnv`], a manager wired to an in-memory file system
//!
//! # Example
//!
//! ```rust
//! use filemerge::testing::TestEnv;
//! use filemerge::CheckpointScope;
//!
//! let env = TestEnv::new();
//! let subtask = env.register(0, 1);
//!
//! let handle = env.write_segment(&subtask, 1, CheckpointScope::Shared, b"state");
//! assert_eq!(env.read(&handle), b"state");
//! ```

mod failpoint;
mod memory_fs;

pub use failpoint::{FailpointAction, FailpointRegistry};
pub use memory_fs::{InMemoryFileSystem, FP_APPEND, FP_CREATE, FP_DELETE, FP_MKDIRS};

use crate::config::FileMergingConfig;
use crate::filemerging::{FileMergingSnapshotManager, SegmentHandle};
use crate::types::{CheckpointId, CheckpointScope, SubtaskKey};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Job id used by [`TestEnv::subtask`].
pub const TEST_JOB_ID: &str = "a1b2c3";
/// Operator id used by [`TestEnv::subtask`].
pub const TEST_OPERATOR_ID: &str = "op-01";

/// A manager initialized on an [`InMemoryFileSystem`] under `/chk/<job>`.
///
/// The helpers panic on failure; they are meant for tests.
#[derive(Debug)]
pub struct TestEnv {
    pub manager: FileMergingSnapshotManager,
    pub fs: Arc<InMemoryFileSystem>,
    pub base_dir: PathBuf,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    /// Create an environment with the default configuration.
    pub fn new() -> Self {
        Self::with_config(FileMergingConfig::default())
    }

    /// Create an environment with a custom configuration.
    pub fn with_config(config: FileMergingConfig) -> Self {
        let fs = Arc::new(InMemoryFileSystem::new());
        let manager = FileMergingSnapshotManager::new(config).expect("valid config");
        let base_dir = PathBuf::from("/chk").join(TEST_JOB_ID);
        manager
            .init_file_system(
                fs.clone(),
                &base_dir,
                &base_dir.join("shared"),
                &base_dir.join("taskowned"),
                0,
            )
            .expect("init file system");
        Self {
            manager,
            fs,
            base_dir,
        }
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.base_dir.join("shared")
    }

    pub fn task_owned_dir(&self) -> PathBuf {
        self.base_dir.join("taskowned")
    }

    /// Key of a subtask of the test operator.
    pub fn subtask(&self, index: u32, parallelism: u32) -> SubtaskKey {
        SubtaskKey::new(TEST_JOB_ID, TEST_OPERATOR_ID, index, parallelism)
    }

    /// Key of a subtask, registered for shared state.
    pub fn register(&self, index: u32, parallelism: u32) -> SubtaskKey {
        let subtask = self.subtask(index, parallelism);
        self.manager
            .register_subtask_for_shared_states(&subtask)
            .expect("register subtask");
        subtask
    }

    /// Write one segment and return its handle.
    pub fn write_segment(
        &self,
        subtask: &SubtaskKey,
        checkpoint_id: CheckpointId,
        scope: CheckpointScope,
        data: &[u8],
    ) -> SegmentHandle {
        let mut stream = self
            .manager
            .create_checkpoint_state_output_stream(subtask, checkpoint_id, scope)
            .expect("create stream");
        stream.write_all(data).expect("write segment");
        stream
            .close_and_get_handle()
            .expect("close stream")
            .expect("non-empty segment")
    }

    /// Read the bytes behind a handle.
    pub fn read(&self, handle: &SegmentHandle) -> Vec<u8> {
        self.fs
            .read_range(&handle.file_path, handle.offset, handle.length)
            .expect("segment readable")
    }

    /// Whether the physical file of a handle still exists.
    pub fn file_exists(&self, path: &Path) -> bool {
        self.fs.read(path).is_some()
    }
}
