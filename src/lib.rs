//! Checkpoint file merging for stream processing workers.
//!
//! A worker runs many subtasks, and every checkpoint each of them produces
//! one or more small state fragments. Writing each fragment to its own file
//! floods the checkpoint file system with tiny files. This crate packs the
//! fragments into a few larger physical files instead:
//! - **Segment streams** append a fragment to a pooled physical file and
//!   return a handle `(file, offset, length)`
//! - **Reference tracking** records which checkpoints still need which
//!   segments, so a physical file is deleted exactly when it becomes garbage
//! - **Reuse** lets a new checkpoint reference an older segment instead of
//!   rewriting it, bounded by the acceptable space amplification
//!
//! # Example
//!
//! ```rust
//! use filemerge::testing::InMemoryFileSystem;
//! use filemerge::{CheckpointScope, FileMergingConfig, FileMergingSnapshotManager, SubtaskKey};
//! use std::io::Write;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FileMergingConfig::new()
//!     .with_max_file_size(64 * 1024 * 1024)
//!     .with_max_space_amplification(2.0);
//! let manager = FileMergingSnapshotManager::new(config)?;
//!
//! manager.init_file_system(
//!     Arc::new(InMemoryFileSystem::new()),
//!     Path::new("/checkpoints/job"),
//!     Path::new("/checkpoints/job/shared"),
//!     Path::new("/checkpoints/job/taskowned"),
//!     0,
//! )?;
//!
//! let subtask = SubtaskKey::new("job", "operator", 0, 2);
//! manager.register_subtask_for_shared_states(&subtask)?;
//!
//! // Write a segment for checkpoint 1
//! let mut stream =
//!     manager.create_checkpoint_state_output_stream(&subtask, 1, CheckpointScope::Shared)?;
//! stream.write_all(b"operator state")?;
//! let handle = stream.close_and_get_handle()?.expect("bytes were written");
//!
//! // Checkpoint 2 references the same bytes
//! if manager.could_reuse_previous_state_handle(&handle) {
//!     manager.reuse_previous_state_handle(2, &[handle.clone()]);
//! }
//!
//! manager.notify_checkpoint_complete(&subtask, 1);
//! manager.notify_checkpoint_complete(&subtask, 2);
//! manager.notify_checkpoint_subsumed(&subtask, 1);
//! assert!(manager.segment(&handle).is_some());
//! # Ok(())
//! # }
//! ```
//!
//! # Layout
//!
//! ```text
//! <checkpoint base dir>/
//!     shared/<job>_<operator>_<index>_<parallelism>_/   shared state
//!     taskowned/                                     exclusive state
//! ```
//!
//! Physical files are named with random UUIDs.

pub mod config;
pub mod error;
pub mod filemerging;
pub mod fs;
pub mod metrics;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{FileMergingConfig, FileMergingType};
pub use error::{Error, Result};
pub use types::{CheckpointId, CheckpointScope, SubtaskKey};

pub use filemerging::{
    CheckpointState, DirectoryHandle, FileMergingSnapshotManager, PhysicalFileState,
    SegmentHandle, SegmentOutputStream, SpaceStatSnapshot,
};

pub use fs::{AppendableFile, FileSystem, LocalFileSystem};

pub use metrics::{Counter, FileMergingMetrics, Gauge, MetricsSnapshot};
