//! The file-merging snapshot manager.
//!
//! One manager runs per job in every worker process. Subtasks obtain segment
//! output streams from it, and the checkpoint coordinator's notifications
//! drive reference release and physical file deletion.

use super::directory::DirectoryManager;
use super::lifecycle::{CheckpointLifecycleTracker, CheckpointState};
use super::physical_file::PhysicalFile;
use super::pool::{PhysicalFilePool, PoolKey};
use super::registry::SegmentRegistry;
use super::segment::{DirectoryHandle, LogicalSegment, SegmentHandle};
use super::space::{SpaceAccountant, SpaceStatSnapshot};
use super::stream::SegmentOutputStream;
use crate::config::{FileMergingConfig, FileMergingType};
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::metrics::{FileMergingMetrics, MetricsSnapshot};
use crate::types::{CheckpointId, CheckpointScope, SubtaskKey};
use dashmap::DashSet;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared between the manager and its open streams.
#[derive(Debug)]
pub(crate) struct ManagerInner {
    config: FileMergingConfig,
    dirs: DirectoryManager,
    pool: PhysicalFilePool,
    registry: SegmentRegistry,
    tracker: CheckpointLifecycleTracker,
    space: Arc<SpaceAccountant>,
    metrics: Arc<FileMergingMetrics>,
    /// Unregistered subtasks whose bookkeeping is dropped once idle.
    retired: DashSet<SubtaskKey>,
    closed: AtomicBool,
}

impl ManagerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a file of `key` may go back to its pool.
    fn keep_open(&self, key: &PoolKey) -> bool {
        if self.is_closed() {
            return false;
        }
        if key.scope == CheckpointScope::Shared && !self.dirs.is_registered(&key.subtask) {
            return false;
        }
        match key.checkpoint_id {
            Some(checkpoint_id) => !self.tracker.is_notified(&key.subtask, checkpoint_id),
            None => true,
        }
    }

    pub(crate) fn record_append(&self, scope: CheckpointScope, len: u64) {
        self.space.for_scope(scope).on_physical_file_update(len);
        self.metrics.bytes_written.inc_by(len);
    }

    /// Give a claimed file back to its pool, or seal it.
    pub(crate) fn return_file(&self, fs: &dyn FileSystem, key: &PoolKey, file: Arc<PhysicalFile>) {
        self.pool.release_claim(fs, key, file, self.keep_open(key));
        // A notification, unregistration or close may have swept the pool
        // between the check and the push.
        if !self.keep_open(key) {
            self.pool.seal_pool(fs, key);
        }
    }

    /// Register the segment written by a closed stream.
    pub(crate) fn finish_segment(
        &self,
        fs: &dyn FileSystem,
        key: &PoolKey,
        file: Arc<PhysicalFile>,
        checkpoint_id: CheckpointId,
        offset: u64,
        length: u64,
    ) -> SegmentHandle {
        let segment = Arc::new(LogicalSegment::new(
            file.clone(),
            offset,
            length,
            checkpoint_id,
            key.subtask.clone(),
        ));
        let handle = segment.handle();
        self.registry.register(segment);
        self.metrics.segments_written.inc();
        self.return_file(fs, key, file);

        if self.tracker.is_released(&key.subtask, checkpoint_id) {
            debug!(subtask = %key.subtask, checkpoint_id, segment = %handle, "Segment closed after its checkpoint was released");
            self.release(fs, &key.subtask, &[checkpoint_id]);
        }
        handle
    }

    /// A stream was dropped without being closed.
    pub(crate) fn abandon(&self, fs: &dyn FileSystem, key: &PoolKey, file: Arc<PhysicalFile>, written: u64) {
        if written == 0 {
            self.return_file(fs, key, file);
        } else {
            warn!(path = %file.path().display(), written, "Stream dropped after writing, sealing physical file");
            self.pool.seal_and_reclaim(fs, &file);
        }
    }

    pub(crate) fn on_write_failure(&self, fs: &dyn FileSystem, file: &Arc<PhysicalFile>, error: &io::Error) {
        self.metrics.write_failures.inc();
        warn!(path = %file.path().display(), %error, "Write to physical file failed, abandoning it");
        self.pool.seal_and_reclaim(fs, file);
    }

    fn release(&self, fs: &dyn FileSystem, subtask: &SubtaskKey, checkpoints: &[CheckpointId]) {
        if checkpoints.is_empty() {
            return;
        }
        for file in self.registry.release(subtask, checkpoints) {
            self.pool.reclaim(fs, &file);
        }
    }

    /// Drop the tracker and registry state of a retired subtask once no
    /// checkpoint of it references a segment.
    fn prune_retired(&self, subtask: &SubtaskKey) {
        if !self.retired.contains(subtask) || !self.registry.forget_if_idle(subtask) {
            return;
        }
        self.tracker.forget(subtask);
        self.retired.remove(subtask);
        debug!(%subtask, "Pruned bookkeeping of unregistered subtask");
    }

    fn on_notification(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId, released: &[CheckpointId]) {
        // Nothing can have been written before initialization.
        let Ok(fs) = self.dirs.file_system() else {
            return;
        };
        self.release(fs.as_ref(), subtask, released);
        self.prune_retired(subtask);

        if self.config.merging_type == FileMergingType::WithinCheckpoint {
            self.pool.seal_checkpoint(fs.as_ref(), subtask, checkpoint_id);
            for id in released {
                self.pool.seal_checkpoint(fs.as_ref(), subtask, *id);
            }
        }
        self.pool.retry_pending_deletes(fs.as_ref());
    }
}

/// Merges checkpoint state of many subtasks into few physical files.
///
/// # Example
///
/// ```rust
/// use filemerge::testing::InMemoryFileSystem;
/// use filemerge::{CheckpointScope, FileMergingConfig, FileMergingSnapshotManager, SubtaskKey};
/// use std::io::Write;
/// use std::path::Path;
/// use std::sync::Arc;
///
/// let manager = FileMergingSnapshotManager::new(FileMergingConfig::default()).unwrap();
/// manager
///     .init_file_system(
///         Arc::new(InMemoryFileSystem::new()),
///         Path::new("/chk/job"),
///         Path::new("/chk/job/shared"),
///         Path::new("/chk/job/taskowned"),
///         0,
///     )
///     .unwrap();
///
/// let subtask = SubtaskKey::new("job", "op", 0, 1);
/// manager.register_subtask_for_shared_states(&subtask).unwrap();
///
/// let mut stream = manager
///     .create_checkpoint_state_output_stream(&subtask, 1, CheckpointScope::Shared)
///     .unwrap();
/// stream.write_all(b"state").unwrap();
/// let handle = stream.close_and_get_handle().unwrap().unwrap();
/// assert_eq!(handle.length, 5);
///
/// manager.notify_checkpoint_complete(&subtask, 1);
/// ```
#[derive(Debug)]
pub struct FileMergingSnapshotManager {
    inner: Arc<ManagerInner>,
}

impl FileMergingSnapshotManager {
    /// Create a manager. The file system is set later with
    /// [`init_file_system`](Self::init_file_system).
    pub fn new(config: FileMergingConfig) -> Result<Self> {
        config.validate()?;

        let space = Arc::new(SpaceAccountant::new());
        let metrics = Arc::new(FileMergingMetrics::new());
        let inner = ManagerInner {
            dirs: DirectoryManager::new(config.default_write_buffer_size),
            pool: PhysicalFilePool::new(&config, space.clone(), metrics.clone()),
            registry: SegmentRegistry::new(space.clone()),
            tracker: CheckpointLifecycleTracker::new(),
            space,
            metrics,
            config,
            retired: DashSet::new(),
            closed: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Configuration the manager was created with.
    pub fn config(&self) -> &FileMergingConfig {
        &self.inner.config
    }

    /// Fix the file system and the managed directories.
    ///
    /// Idempotent for identical paths; a changed path fails with
    /// [`Error::ConfigurationConflict`]. `write_buffer_size` 0 selects the
    /// configured default.
    pub fn init_file_system(
        &self,
        fs: Arc<dyn FileSystem>,
        base_dir: &Path,
        shared_dir: &Path,
        task_owned_dir: &Path,
        write_buffer_size: usize,
    ) -> Result<()> {
        self.inner
            .dirs
            .init_file_system(fs, base_dir, shared_dir, task_owned_dir, write_buffer_size)
    }

    /// Create the subtask's shared directory. Idempotent.
    pub fn register_subtask_for_shared_states(&self, subtask: &SubtaskKey) -> Result<()> {
        self.inner.dirs.register_subtask_for_shared_states(subtask)?;
        self.inner.retired.remove(subtask);
        Ok(())
    }

    /// Forget a subtask's shared directory and seal its pooled files.
    ///
    /// Files still referenced by checkpoints stay until those are released.
    /// The subtask's checkpoint states are dropped once nothing of it is
    /// referenced any more.
    pub fn unregister_subtask(&self, subtask: &SubtaskKey) {
        self.inner.dirs.unregister_subtask(subtask);
        self.inner.retired.insert(subtask.clone());
        if let Ok(fs) = self.inner.dirs.file_system() {
            let sealed = self.inner.pool.seal_subtask(fs.as_ref(), subtask);
            debug!(%subtask, sealed, "Sealed pooled files of unregistered subtask");
        }
        self.inner.prune_retired(subtask);
    }

    /// Managed directory of a subtask for a scope.
    pub fn get_managed_dir(&self, subtask: &SubtaskKey, scope: CheckpointScope) -> Result<PathBuf> {
        self.inner.dirs.managed_dir(subtask, scope)
    }

    /// [`DirectoryHandle`] of a managed directory, for checkpoint metadata.
    pub fn get_managed_dir_state_handle(
        &self,
        subtask: &SubtaskKey,
        scope: CheckpointScope,
    ) -> Result<DirectoryHandle> {
        self.inner.dirs.managed_dir_handle(subtask, scope)
    }

    /// Open a stream for one segment of `checkpoint_id`.
    pub fn create_checkpoint_state_output_stream(
        &self,
        subtask: &SubtaskKey,
        checkpoint_id: CheckpointId,
        scope: CheckpointScope,
    ) -> Result<SegmentOutputStream> {
        if self.inner.is_closed() {
            return Err(Error::StreamClosed);
        }
        let layout = self.inner.dirs.layout()?;
        let dir = self.inner.dirs.managed_dir(subtask, scope)?;

        let state = self.inner.tracker.begin(subtask, checkpoint_id);
        if state.is_released() {
            debug!(%subtask, checkpoint_id, %state, "Opening stream for released checkpoint");
        }

        let key = self.inner.pool.pool_key(subtask, scope, checkpoint_id);
        let file = self.inner.pool.allocate(layout.fs.as_ref(), &dir, &key)?;
        Ok(SegmentOutputStream::new(
            self.inner.clone(),
            layout.fs.clone(),
            key,
            checkpoint_id,
            file,
            layout.write_buffer_size,
        ))
    }

    /// The checkpoint completed. Pending checkpoints below it are subsumed.
    pub fn notify_checkpoint_complete(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) {
        let released = self.inner.tracker.complete(subtask, checkpoint_id);
        self.inner.on_notification(subtask, checkpoint_id, &released);
    }

    /// The checkpoint was aborted; its references are dropped.
    pub fn notify_checkpoint_aborted(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) {
        let released = self.inner.tracker.abort(subtask, checkpoint_id);
        self.inner.on_notification(subtask, checkpoint_id, &released);
    }

    /// The checkpoint and all older ones are no longer needed.
    pub fn notify_checkpoint_subsumed(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) {
        let released = self.inner.tracker.subsume(subtask, checkpoint_id);
        self.inner.on_notification(subtask, checkpoint_id, &released);
    }

    /// Whether a previously written segment may be referenced again.
    pub fn could_reuse_previous_state_handle(&self, handle: &SegmentHandle) -> bool {
        let reusable = self
            .inner
            .registry
            .could_reuse(handle, self.inner.config.min_live_fraction);
        if reusable {
            self.inner.metrics.reuse_accepted.inc();
        } else {
            self.inner.metrics.reuse_refused.inc();
        }
        reusable
    }

    /// Reference previously written segments from `checkpoint_id`.
    ///
    /// Unknown or released handles are skipped.
    pub fn reuse_previous_state_handle(&self, checkpoint_id: CheckpointId, handles: &[SegmentHandle]) {
        for subtask in self.inner.registry.reuse(checkpoint_id, handles) {
            if self.inner.tracker.begin(&subtask, checkpoint_id).is_released() {
                if let Ok(fs) = self.inner.dirs.file_system() {
                    self.inner.release(fs.as_ref(), &subtask, &[checkpoint_id]);
                }
            }
        }
    }

    /// Re-register the segments of a restored checkpoint.
    ///
    /// Shared handles require a registered subtask. Every referenced file
    /// must exist and the segments of one file must not overlap; nothing is
    /// changed when either check fails. Files outside the managed
    /// directories are tracked but never deleted.
    pub fn restore_state_handles(
        &self,
        checkpoint_id: CheckpointId,
        subtask: &SubtaskKey,
        handles: &[SegmentHandle],
    ) -> Result<()> {
        let fs = self.inner.dirs.file_system()?;
        if handles.iter().any(|h| h.scope == CheckpointScope::Shared)
            && !self.inner.dirs.is_registered(subtask)
        {
            return Err(Error::NotRegistered {
                subtask: subtask.clone(),
                scope: CheckpointScope::Shared,
            });
        }

        let mut ranges: BTreeMap<&Path, Vec<(u64, u64)>> = BTreeMap::new();
        for handle in handles {
            let end = handle.checked_end().ok_or_else(|| {
                Error::CorruptedRestoreState(format!(
                    "segment {} of checkpoint {} of {} ends past u64::MAX",
                    handle, checkpoint_id, subtask
                ))
            })?;
            ranges
                .entry(handle.file_path.as_path())
                .or_default()
                .push((handle.offset, end));
        }

        let mut extents: BTreeMap<&Path, (CheckpointScope, u64)> = BTreeMap::new();
        for handle in handles {
            let extent = extents
                .entry(handle.file_path.as_path())
                .or_insert((handle.scope, 0));
            extent.1 = extent.1.max(handle.end());
        }

        // The same segment may appear twice; distinct segments must be disjoint.
        for (path, ranges) in ranges.iter_mut() {
            ranges.sort_unstable();
            ranges.dedup();
            if let Some(pair) = ranges.windows(2).find(|pair| pair[1].0 < pair[0].1) {
                return Err(Error::CorruptedRestoreState(format!(
                    "segments [{}, {}) and [{}, {}) of {} overlap in checkpoint {} of {}",
                    pair[0].0,
                    pair[0].1,
                    pair[1].0,
                    pair[1].1,
                    path.display(),
                    checkpoint_id,
                    subtask
                )));
            }
        }
        for path in extents.keys() {
            if !fs.exists(path)? {
                return Err(Error::CorruptedRestoreState(format!(
                    "{} referenced by checkpoint {} of {} does not exist",
                    path.display(),
                    checkpoint_id,
                    subtask
                )));
            }
        }

        let mut files = BTreeMap::new();
        for (path, (scope, end)) in &extents {
            let owned = path.starts_with(self.inner.dirs.expected_dir(subtask, *scope)?);
            let file = self
                .inner
                .pool
                .restore_file(path, *scope, subtask, owned, *end);
            files.insert(*path, file);
        }

        let mut restored = 0;
        for handle in handles {
            let Some(file) = files.get(handle.file_path.as_path()) else {
                continue;
            };
            if self
                .inner
                .registry
                .restore(checkpoint_id, subtask, handle, file.clone())
            {
                restored += 1;
            }
        }
        self.inner.metrics.segments_restored.inc_by(restored);
        self.inner.tracker.restore(subtask, checkpoint_id);

        if self.inner.tracker.is_released(subtask, checkpoint_id) {
            self.inner.release(fs.as_ref(), subtask, &[checkpoint_id]);
        }

        info!(
            %subtask,
            checkpoint_id,
            segments = restored,
            files = files.len(),
            "Restored state handles"
        );
        Ok(())
    }

    /// Seal every pooled file and delete the unreferenced ones.
    ///
    /// Streams created afterwards fail with [`Error::StreamClosed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(fs) = self.inner.dirs.file_system() {
            let sealed = self.inner.pool.seal_all(fs.as_ref());
            self.inner.pool.retry_pending_deletes(fs.as_ref());
            info!(
                sealed,
                remaining_files = self.inner.pool.file_count(),
                "File merging snapshot manager closed"
            );
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Space usage of one scope.
    pub fn space_stat(&self, scope: CheckpointScope) -> SpaceStatSnapshot {
        self.inner.space.for_scope(scope).snapshot()
    }

    /// Counters since startup.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Counters and per-scope space gauges in Prometheus text format.
    pub fn prometheus_text(&self) -> String {
        let mut out = self.inner.metrics.to_prometheus();
        out.push_str(&self.inner.space.to_prometheus());
        out
    }

    /// Tracked state of a checkpoint, `None` if unknown or pruned.
    pub fn checkpoint_state(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> Option<CheckpointState> {
        self.inner.tracker.state(subtask, checkpoint_id)
    }

    /// Live physical file at `path`.
    pub fn physical_file(&self, path: &Path) -> Option<Arc<PhysicalFile>> {
        self.inner.pool.get(path)
    }

    /// Number of physical files not yet deleted.
    pub fn physical_file_count(&self) -> usize {
        self.inner.pool.file_count()
    }

    /// Number of live logical segments.
    pub fn segment_count(&self) -> usize {
        self.inner.registry.segment_count()
    }

    /// Live segment behind a handle.
    pub fn segment(&self, handle: &SegmentHandle) -> Option<Arc<LogicalSegment>> {
        self.inner.registry.get(handle)
    }

    /// Handles referenced by a checkpoint of a subtask, ordered by file and offset.
    pub fn segments_of(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> Vec<SegmentHandle> {
        self.inner.registry.handles_for(subtask, checkpoint_id)
    }
}
