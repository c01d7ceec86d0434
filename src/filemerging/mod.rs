//! Checkpoint file merging.
//!
//! Many small state segments written by the subtasks of a job are packed into
//! a few larger physical files. Each segment stays individually addressable
//! through its [`SegmentHandle`], and a physical file is deleted exactly when
//! no checkpoint references any of its segments anymore.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 FileMergingSnapshotManager                    │
//! │                                                              │
//! │  create_checkpoint_state_output_stream ──> SegmentOutputStream
//! │  notify_checkpoint_{complete,aborted,subsumed}               │
//! │  could_reuse / reuse / restore_state_handles                 │
//! └──────────────────────────────────────────────────────────────┘
//!        │              │                 │               │
//!        ▼              ▼                 ▼               ▼
//! ┌────────────┐ ┌──────────────┐ ┌───────────────┐ ┌───────────┐
//! │ Directory  │ │ PhysicalFile │ │   Segment     │ │ Lifecycle │
//! │  Manager   │ │     Pool     │ │   Registry    │ │  Tracker  │
//! └────────────┘ └──────────────┘ └───────────────┘ └───────────┘
//!                        │                │
//!                        └──── SpaceAccountant ────┘
//! ```

mod directory;
mod lifecycle;
mod manager;
mod physical_file;
mod pool;
mod registry;
mod segment;
mod space;
mod stream;

pub use directory::DirectoryManager;
pub use lifecycle::{CheckpointLifecycleTracker, CheckpointState};
pub use manager::FileMergingSnapshotManager;
pub use physical_file::{PhysicalFile, PhysicalFileState};
pub use pool::{PhysicalFilePool, PoolKey};
pub use registry::SegmentRegistry;
pub use segment::{DirectoryHandle, LogicalSegment, SegmentHandle};
pub use space::{SpaceAccountant, SpaceStat, SpaceStatSnapshot};
pub use stream::SegmentOutputStream;
