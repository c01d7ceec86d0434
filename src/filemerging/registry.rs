//! Registry of live logical segments.

use super::physical_file::PhysicalFile;
use super::segment::{Detached, LogicalSegment, SegmentHandle, SegmentKey};
use super::space::SpaceAccountant;
use crate::types::{CheckpointId, SubtaskKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

type CheckpointIndex = BTreeMap<CheckpointId, HashSet<SegmentKey>>;

/// Maps segment handles to live segments and indexes them by the
/// checkpoints referencing them.
#[derive(Debug)]
pub struct SegmentRegistry {
    segments: DashMap<SegmentKey, Arc<LogicalSegment>>,
    /// Subtask -> checkpoint -> segments referenced by that checkpoint.
    by_subtask: DashMap<SubtaskKey, CheckpointIndex>,
    space: Arc<SpaceAccountant>,
}

impl SegmentRegistry {
    pub fn new(space: Arc<SpaceAccountant>) -> Self {
        Self {
            segments: DashMap::new(),
            by_subtask: DashMap::new(),
            space,
        }
    }

    fn index(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId, key: SegmentKey) {
        self.by_subtask
            .entry(subtask.clone())
            .or_default()
            .entry(checkpoint_id)
            .or_default()
            .insert(key);
    }

    /// Record a segment produced by a closed stream.
    pub fn register(&self, segment: Arc<LogicalSegment>) {
        let key = segment.key();
        self.space
            .for_scope(segment.scope())
            .on_logical_file_create(segment.length());
        debug!(
            subtask = %segment.subtask(),
            checkpoint_id = segment.checkpoint_id(),
            segment = %segment.handle(),
            "Registered segment"
        );

        // Indexed only once visible, so a concurrent release never skips it.
        let (subtask, checkpoint_id) = (segment.subtask().clone(), segment.checkpoint_id());
        self.segments.insert(key.clone(), segment);
        self.index(&subtask, checkpoint_id, key);
    }

    /// Drop the subtask's index if no checkpoint of it references a segment.
    /// Returns whether the subtask has no index left.
    pub fn forget_if_idle(&self, subtask: &SubtaskKey) -> bool {
        self.by_subtask
            .remove_if(subtask, |_, index| index.values().all(HashSet::is_empty));
        !self.by_subtask.contains_key(subtask)
    }

    /// Look up the live segment behind a handle.
    pub fn get(&self, handle: &SegmentHandle) -> Option<Arc<LogicalSegment>> {
        self.segments
            .get(&handle.key())
            .map(|segment| segment.value().clone())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Handles of segments referenced by a checkpoint of a subtask.
    pub fn handles_for(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> Vec<SegmentHandle> {
        let keys: Vec<SegmentKey> = match self.by_subtask.get(subtask) {
            Some(index) => index
                .get(&checkpoint_id)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
            None => return Vec::new(),
        };
        let mut handles: Vec<SegmentHandle> = keys
            .iter()
            .filter_map(|key| self.segments.get(key).map(|s| s.handle()))
            .collect();
        handles.sort_by(|a, b| (&a.file_path, a.offset).cmp(&(&b.file_path, b.offset)));
        handles
    }

    /// Drop the references of `checkpoints` for a subtask.
    ///
    /// Segments left without references are released. Returns the physical
    /// files that became sealed and unreferenced.
    pub fn release(&self, subtask: &SubtaskKey, checkpoints: &[CheckpointId]) -> Vec<Arc<PhysicalFile>> {
        let detached: Vec<(CheckpointId, SegmentKey)> = match self.by_subtask.get_mut(subtask) {
            Some(mut index) => checkpoints
                .iter()
                .filter_map(|id| index.remove(id).map(|keys| (*id, keys)))
                .flat_map(|(id, keys)| keys.into_iter().map(move |key| (id, key)))
                .collect(),
            None => return Vec::new(),
        };

        let mut reclaimable = Vec::new();
        for (checkpoint_id, key) in detached {
            let Some(segment) = self.segments.get(&key).map(|s| s.value().clone()) else {
                continue;
            };
            match segment.detach(checkpoint_id) {
                Detached::NotReferenced => {}
                Detached::Removed {
                    segment_released,
                    file_reclaimable,
                } => {
                    if segment_released {
                        self.space
                            .for_scope(segment.scope())
                            .on_logical_file_delete(segment.length());
                        self.segments
                            .remove_if(&key, |_, s| Arc::ptr_eq(s, &segment));
                        debug!(%subtask, checkpoint_id, segment = %segment.handle(), "Released segment");
                    }
                    if file_reclaimable {
                        reclaimable.push(segment.file().clone());
                    }
                }
            }
        }
        reclaimable
    }

    /// Whether `handle` may be referenced by a new checkpoint instead of
    /// rewriting its bytes.
    pub fn could_reuse(&self, handle: &SegmentHandle, min_live_fraction: f64) -> bool {
        let Some(segment) = self.get(handle) else {
            return false;
        };
        if segment.is_released() || segment.file().is_deleted() || segment.length() != handle.length {
            return false;
        }
        self.space.for_scope(segment.scope()).live_fraction() >= min_live_fraction
    }

    /// Add `checkpoint_id` as a reference to each known segment.
    ///
    /// Returns the owners of the segments that gained the reference.
    pub fn reuse(&self, checkpoint_id: CheckpointId, handles: &[SegmentHandle]) -> HashSet<SubtaskKey> {
        let mut owners = HashSet::new();
        for handle in handles {
            let Some(segment) = self.get(handle) else {
                debug!(checkpoint_id, segment = %handle, "Ignoring reuse of unknown segment");
                continue;
            };
            if segment.attach(checkpoint_id) {
                self.index(segment.subtask(), checkpoint_id, segment.key());
                owners.insert(segment.subtask().clone());
                debug!(checkpoint_id, segment = %handle, "Reused segment");
            } else {
                debug!(checkpoint_id, segment = %handle, "Segment not reusable or already referenced");
            }
        }
        owners
    }

    /// Register a segment found in a restored checkpoint.
    ///
    /// Returns true if the segment was new to the registry.
    pub fn restore(
        &self,
        checkpoint_id: CheckpointId,
        subtask: &SubtaskKey,
        handle: &SegmentHandle,
        file: Arc<PhysicalFile>,
    ) -> bool {
        let key = handle.key();
        let created = match self.segments.entry(key.clone()) {
            Entry::Occupied(entry) => {
                entry.get().attach(checkpoint_id);
                false
            }
            Entry::Vacant(entry) => {
                let segment =
                    LogicalSegment::new(file, handle.offset, handle.length, checkpoint_id, subtask.clone());
                self.space
                    .for_scope(segment.scope())
                    .on_logical_file_create(segment.length());
                entry.insert(Arc::new(segment));
                true
            }
        };
        self.index(subtask, checkpoint_id, key);
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckpointScope;
    use std::path::PathBuf;

    fn subtask() -> SubtaskKey {
        SubtaskKey::new("job", "op", 0, 1)
    }

    fn file(space: &SpaceAccountant, name: &str, size: u64) -> Arc<PhysicalFile> {
        let file = Arc::new(PhysicalFile::restored(
            PathBuf::from("/shared").join(name),
            CheckpointScope::Shared,
            subtask(),
            true,
        ));
        let stat = space.for_scope(CheckpointScope::Shared);
        stat.on_physical_file_create();
        stat.on_physical_file_update(file.extend_to(size));
        file
    }

    fn segment(file: &Arc<PhysicalFile>, offset: u64, length: u64, checkpoint_id: CheckpointId) -> Arc<LogicalSegment> {
        Arc::new(LogicalSegment::new(file.clone(), offset, length, checkpoint_id, subtask()))
    }

    #[test]
    fn test_forget_if_idle() {
        let space = Arc::new(SpaceAccountant::new());
        let registry = SegmentRegistry::new(space.clone());
        let f = file(&space, "a", 10);

        assert!(registry.forget_if_idle(&subtask()));
        registry.register(segment(&f, 0, 10, 1));
        assert!(!registry.forget_if_idle(&subtask()));

        registry.release(&subtask(), &[1]);
        assert!(registry.forget_if_idle(&subtask()));
        assert!(registry.handles_for(&subtask(), 1).is_empty());
    }

    #[test]
    fn test_register_and_release() {
        let space = Arc::new(SpaceAccountant::new());
        let registry = SegmentRegistry::new(space.clone());
        let f = file(&space, "a", 30);

        registry.register(segment(&f, 0, 10, 1));
        registry.register(segment(&f, 10, 20, 2));
        assert_eq!(registry.segment_count(), 2);
        assert_eq!(registry.handles_for(&subtask(), 1).len(), 1);

        assert!(registry.release(&subtask(), &[1]).is_empty());
        let stat = space.for_scope(CheckpointScope::Shared).snapshot();
        assert_eq!(stat.logical_file_count, 1);
        assert_eq!(stat.logical_file_size, 20);

        // Releasing twice is a no-op.
        assert!(registry.release(&subtask(), &[1]).is_empty());
        assert_eq!(registry.segment_count(), 1);
    }

    #[test]
    fn test_reuse_keeps_segment_alive() {
        let space = Arc::new(SpaceAccountant::new());
        let registry = SegmentRegistry::new(space.clone());
        let f = file(&space, "a", 10);
        let seg = segment(&f, 0, 10, 1);
        let handle = seg.handle();
        registry.register(seg);

        assert!(registry.could_reuse(&handle, 0.5));
        let owners = registry.reuse(2, &[handle.clone()]);
        assert!(owners.contains(&subtask()));
        assert_eq!(f.reference_set(), vec![1, 2]);

        registry.release(&subtask(), &[1]);
        assert!(registry.get(&handle).is_some());
        assert_eq!(f.reference_set(), vec![2]);

        registry.release(&subtask(), &[2]);
        assert!(registry.get(&handle).is_none());
        assert!(!registry.could_reuse(&handle, 0.0));
    }

    #[test]
    fn test_reuse_refused_below_live_fraction() {
        let space = Arc::new(SpaceAccountant::new());
        let registry = SegmentRegistry::new(space.clone());
        let f = file(&space, "a", 100);
        let seg = segment(&f, 0, 10, 1);
        let handle = seg.handle();
        registry.register(seg);

        assert!(!registry.could_reuse(&handle, 0.5));
        assert!(registry.could_reuse(&handle, 0.1));

        let unknown = SegmentHandle::new("/shared/a", 50, 10, CheckpointScope::Shared);
        assert!(!registry.could_reuse(&unknown, 0.0));
        assert!(registry.reuse(2, &[unknown]).is_empty());
    }

    #[test]
    fn test_release_returns_reclaimable_files() {
        let space = Arc::new(SpaceAccountant::new());
        let registry = SegmentRegistry::new(space.clone());
        let f = file(&space, "a", 20);
        registry.register(segment(&f, 0, 10, 1));
        registry.register(segment(&f, 10, 10, 1));

        let files = registry.release(&subtask(), &[1]);
        assert_eq!(files.len(), 1);
        assert!(Arc::ptr_eq(&files[0], &f));
    }

    #[test]
    fn test_restore_is_idempotent() {
        let space = Arc::new(SpaceAccountant::new());
        let registry = SegmentRegistry::new(space.clone());
        let f = file(&space, "a", 10);
        let handle = SegmentHandle::new("/shared/a", 0, 10, CheckpointScope::Shared);

        assert!(registry.restore(3, &subtask(), &handle, f.clone()));
        assert!(!registry.restore(3, &subtask(), &handle, f.clone()));

        assert_eq!(registry.segment_count(), 1);
        assert_eq!(f.reference_set(), vec![3]);
        assert_eq!(
            space
                .for_scope(CheckpointScope::Shared)
                .snapshot()
                .logical_file_size,
            10
        );
    }
}
