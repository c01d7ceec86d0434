//! Pools of open physical files.
//!
//! A file is taken out of its pool while a stream writes to it and pushed back
//! when the stream closes, so writers never share a file concurrently and an
//! allocation never waits: with an empty pool it simply creates a new file.

use super::physical_file::{DeleteOutcome, PhysicalFile};
use super::space::SpaceAccountant;
use crate::config::{FileMergingConfig, FileMergingType};
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::metrics::FileMergingMetrics;
use crate::types::{CheckpointId, CheckpointScope, SubtaskKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one pool of open files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub subtask: SubtaskKey,
    pub scope: CheckpointScope,
    /// Set only when merging within a checkpoint.
    pub checkpoint_id: Option<CheckpointId>,
}

/// Owns every physical file the engine knows about.
#[derive(Debug)]
pub struct PhysicalFilePool {
    merging_type: FileMergingType,
    max_file_size: u64,
    shared_pool_size: usize,
    files: DashMap<PathBuf, Arc<PhysicalFile>>,
    open: DashMap<PoolKey, VecDeque<Arc<PhysicalFile>>>,
    pending_deletes: Mutex<Vec<Arc<PhysicalFile>>>,
    space: Arc<SpaceAccountant>,
    metrics: Arc<FileMergingMetrics>,
}

impl PhysicalFilePool {
    pub fn new(
        config: &FileMergingConfig,
        space: Arc<SpaceAccountant>,
        metrics: Arc<FileMergingMetrics>,
    ) -> Self {
        Self {
            merging_type: config.merging_type,
            max_file_size: config.max_file_size,
            shared_pool_size: config.shared_pool_size,
            files: DashMap::new(),
            open: DashMap::new(),
            pending_deletes: Mutex::new(Vec::new()),
            space,
            metrics,
        }
    }

    pub fn pool_key(
        &self,
        subtask: &SubtaskKey,
        scope: CheckpointScope,
        checkpoint_id: CheckpointId,
    ) -> PoolKey {
        PoolKey {
            subtask: subtask.clone(),
            scope,
            checkpoint_id: match self.merging_type {
                FileMergingType::AcrossCheckpoints => None,
                FileMergingType::WithinCheckpoint => Some(checkpoint_id),
            },
        }
    }

    fn capacity(&self, scope: CheckpointScope) -> usize {
        match scope {
            CheckpointScope::Exclusive => 1,
            CheckpointScope::Shared => self.shared_pool_size,
        }
    }

    /// Claim an open file of the pool, creating one in `dir` if none is free.
    pub fn allocate(&self, fs: &dyn FileSystem, dir: &Path, key: &PoolKey) -> Result<Arc<PhysicalFile>> {
        loop {
            let pooled = self.open.get_mut(key).and_then(|mut queue| queue.pop_front());
            let Some(file) = pooled else { break };
            if file.is_open() && file.size() < self.max_file_size {
                debug!(path = %file.path().display(), offset = file.size(), "Reusing pooled physical file");
                return Ok(file);
            }
            self.seal_and_reclaim(fs, &file);
        }

        let path = dir.join(Uuid::new_v4().to_string());
        let writer = fs.create(&path).map_err(|e| {
            self.metrics.write_failures.inc();
            warn!(path = %path.display(), error = %e, "Failed to create physical file");
            Error::write_failed(&path, e)
        })?;

        let file = Arc::new(PhysicalFile::open(
            path.clone(),
            key.scope,
            key.subtask.clone(),
            writer,
        ));
        self.files.insert(path.clone(), file.clone());
        self.space.for_scope(key.scope).on_physical_file_create();
        self.metrics.physical_files_created.inc();

        debug!(subtask = %key.subtask, scope = %key.scope, path = %path.display(), "Created physical file");
        Ok(file)
    }

    /// Hand a claimed file back after its stream finished.
    ///
    /// The file returns to its pool when it is still open, below the size cap,
    /// `keep_open` is set and the pool has room. Otherwise it is sealed.
    pub fn release_claim(&self, fs: &dyn FileSystem, key: &PoolKey, file: Arc<PhysicalFile>, keep_open: bool) {
        if keep_open && file.size() < self.max_file_size {
            let mut queue = self.open.entry(key.clone()).or_default();
            if queue.len() < self.capacity(key.scope) && file.is_open() {
                queue.push_back(file);
                return;
            }
        }
        self.seal_and_reclaim(fs, &file);
    }

    /// Seal a file and delete it if nothing references it.
    pub fn seal_and_reclaim(&self, fs: &dyn FileSystem, file: &Arc<PhysicalFile>) {
        if file.seal() {
            self.reclaim(fs, file);
        }
    }

    fn seal_where(&self, fs: &dyn FileSystem, pred: impl Fn(&PoolKey) -> bool) -> usize {
        let keys: Vec<PoolKey> = self
            .open
            .iter()
            .filter(|entry| pred(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut sealed = 0;
        for key in keys {
            let Some((_, queue)) = self.open.remove(&key) else {
                continue;
            };
            for file in queue {
                self.seal_and_reclaim(fs, &file);
                sealed += 1;
            }
        }
        sealed
    }

    /// Seal every file waiting in one pool.
    pub fn seal_pool(&self, fs: &dyn FileSystem, key: &PoolKey) -> usize {
        let Some((_, queue)) = self.open.remove(key) else {
            return 0;
        };
        let sealed = queue.len();
        for file in queue {
            self.seal_and_reclaim(fs, &file);
        }
        sealed
    }

    /// Seal every pooled file of a subtask.
    pub fn seal_subtask(&self, fs: &dyn FileSystem, subtask: &SubtaskKey) -> usize {
        self.seal_where(fs, |key| &key.subtask == subtask)
    }

    /// Seal the pooled files dedicated to one checkpoint of a subtask.
    pub fn seal_checkpoint(&self, fs: &dyn FileSystem, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> usize {
        self.seal_where(fs, |key| {
            &key.subtask == subtask && key.checkpoint_id == Some(checkpoint_id)
        })
    }

    pub fn seal_all(&self, fs: &dyn FileSystem) -> usize {
        self.seal_where(fs, |_| true)
    }

    /// Delete a sealed, unreferenced file.
    ///
    /// Failures are logged and queued for [`retry_pending_deletes`](Self::retry_pending_deletes).
    pub fn reclaim(&self, fs: &dyn FileSystem, file: &Arc<PhysicalFile>) -> bool {
        match file.delete_if_unreferenced(fs) {
            DeleteOutcome::Deleted { size } => {
                self.files
                    .remove_if(file.path(), |_, f| Arc::ptr_eq(f, file));
                self.space
                    .for_scope(file.scope())
                    .on_physical_file_delete(size);
                self.metrics.physical_files_reclaimed.inc();
                debug!(path = %file.path().display(), size, owned = file.is_owned(), "Reclaimed physical file");
                true
            }
            DeleteOutcome::Failed(e) => {
                self.metrics.delete_failures.inc();
                warn!(path = %file.path().display(), error = %e, "Failed to delete physical file, will retry");
                self.pending_deletes.lock().push(file.clone());
                false
            }
            DeleteOutcome::NotReclaimable => false,
        }
    }

    /// Retry deletions that failed earlier. Returns how many succeeded.
    pub fn retry_pending_deletes(&self, fs: &dyn FileSystem) -> usize {
        let pending = mem::take(&mut *self.pending_deletes.lock());
        pending
            .iter()
            .filter(|file| self.reclaim(fs, file))
            .count()
    }

    pub fn pending_delete_count(&self) -> usize {
        self.pending_deletes.lock().len()
    }

    /// Track a file referenced by restored handles.
    ///
    /// The file's size grows to `end` if it was smaller.
    pub fn restore_file(
        &self,
        path: &Path,
        scope: CheckpointScope,
        owner: &SubtaskKey,
        owned: bool,
        end: u64,
    ) -> Arc<PhysicalFile> {
        let stat = self.space.for_scope(scope);
        let file = self
            .files
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                stat.on_physical_file_create();
                Arc::new(PhysicalFile::restored(
                    path.to_path_buf(),
                    scope,
                    owner.clone(),
                    owned,
                ))
            })
            .value()
            .clone();
        stat.on_physical_file_update(file.extend_to(end));
        file
    }

    pub fn get(&self, path: &Path) -> Option<Arc<PhysicalFile>> {
        self.files.get(path).map(|f| f.value().clone())
    }

    /// Physical files not yet deleted.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Open files currently waiting in a pool.
    pub fn pooled_count(&self, key: &PoolKey) -> usize {
        self.open.get(key).map(|queue| queue.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailpointAction, InMemoryFileSystem, FP_CREATE, FP_DELETE};

    fn setup(config: FileMergingConfig) -> (InMemoryFileSystem, PhysicalFilePool) {
        let fs = InMemoryFileSystem::new();
        fs.mkdirs(Path::new("/shared")).unwrap();
        let pool = PhysicalFilePool::new(
            &config,
            Arc::new(SpaceAccountant::new()),
            Arc::new(FileMergingMetrics::new()),
        );
        (fs, pool)
    }

    fn key(pool: &PhysicalFilePool, scope: CheckpointScope, checkpoint_id: CheckpointId) -> PoolKey {
        pool.pool_key(&SubtaskKey::new("job", "op", 0, 1), scope, checkpoint_id)
    }

    #[test]
    fn test_claimed_file_is_not_shared() {
        let (fs, pool) = setup(FileMergingConfig::default());
        let key = key(&pool, CheckpointScope::Shared, 1);

        let a = pool.allocate(&fs, Path::new("/shared"), &key).unwrap();
        let b = pool.allocate(&fs, Path::new("/shared"), &key).unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(pool.file_count(), 2);

        pool.release_claim(&fs, &key, a.clone(), true);
        let c = pool.allocate(&fs, Path::new("/shared"), &key).unwrap();
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_exclusive_pool_holds_one_file() {
        let (fs, pool) = setup(FileMergingConfig::default());
        let key = key(&pool, CheckpointScope::Exclusive, 1);

        let a = pool.allocate(&fs, Path::new("/shared"), &key).unwrap();
        let b = pool.allocate(&fs, Path::new("/shared"), &key).unwrap();
        a.add_ref(1);
        b.add_ref(1);

        pool.release_claim(&fs, &key, a.clone(), true);
        pool.release_claim(&fs, &key, b.clone(), true);
        assert_eq!(pool.pooled_count(&key), 1);
        assert!(!b.is_open());
    }

    #[test]
    fn test_full_file_is_sealed_and_reclaimed() {
        let (fs, pool) = setup(FileMergingConfig::default().with_max_file_size(4));
        let key = key(&pool, CheckpointScope::Shared, 1);

        let file = pool.allocate(&fs, Path::new("/shared"), &key).unwrap();
        file.append(b"12345").unwrap();
        pool.space.for_scope(CheckpointScope::Shared).on_physical_file_update(5);

        pool.release_claim(&fs, &key, file.clone(), true);
        assert!(file.is_deleted());
        assert_eq!(pool.file_count(), 0);
        assert_eq!(
            pool.space.for_scope(CheckpointScope::Shared).snapshot().physical_file_size,
            0
        );
    }

    #[test]
    fn test_create_failure() {
        let (fs, pool) = setup(FileMergingConfig::default());
        let key = key(&pool, CheckpointScope::Shared, 1);
        fs.failpoints().enable(FP_CREATE, FailpointAction::Once);

        let err = pool.allocate(&fs, Path::new("/shared"), &key).unwrap_err();
        assert!(matches!(err, Error::WriteFailed { .. }));
        assert_eq!(pool.metrics.write_failures.get(), 1);
        assert!(pool.allocate(&fs, Path::new("/shared"), &key).is_ok());
    }

    #[test]
    fn test_failed_delete_is_retried() {
        let (fs, pool) = setup(FileMergingConfig::default());
        let key = key(&pool, CheckpointScope::Shared, 1);
        let file = pool.allocate(&fs, Path::new("/shared"), &key).unwrap();

        fs.failpoints().enable(FP_DELETE, FailpointAction::Once);
        pool.release_claim(&fs, &key, file.clone(), false);
        assert!(!file.is_deleted());
        assert_eq!(pool.pending_delete_count(), 1);

        assert_eq!(pool.retry_pending_deletes(&fs), 1);
        assert!(file.is_deleted());
        assert_eq!(pool.pending_delete_count(), 0);
        assert_eq!(fs.delete_count(file.path()), 1);
    }

    #[test]
    fn test_within_checkpoint_pools() {
        let config = FileMergingConfig::default().with_merging_type(FileMergingType::WithinCheckpoint);
        let (fs, pool) = setup(config);
        let key1 = key(&pool, CheckpointScope::Shared, 1);
        let key2 = key(&pool, CheckpointScope::Shared, 2);
        assert_ne!(key1, key2);

        let a = pool.allocate(&fs, Path::new("/shared"), &key1).unwrap();
        a.add_ref(1);
        pool.release_claim(&fs, &key1, a.clone(), true);

        let b = pool.allocate(&fs, Path::new("/shared"), &key2).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        let subtask = SubtaskKey::new("job", "op", 0, 1);
        assert_eq!(pool.seal_checkpoint(&fs, &subtask, 1), 1);
        assert!(!a.is_open());
        assert!(!a.is_deleted());
    }

    #[test]
    fn test_restore_file_extends_size() {
        let (_fs, pool) = setup(FileMergingConfig::default());
        let owner = SubtaskKey::new("job", "op", 0, 1);
        let path = Path::new("/shared/restored");

        let a = pool.restore_file(path, CheckpointScope::Shared, &owner, true, 10);
        let b = pool.restore_file(path, CheckpointScope::Shared, &owner, true, 25);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.size(), 25);

        let stat = pool.space.for_scope(CheckpointScope::Shared).snapshot();
        assert_eq!(stat.physical_file_count, 1);
        assert_eq!(stat.physical_file_size, 25);
    }
}
