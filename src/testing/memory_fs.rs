//! In-memory file system with failure injection.

use super::failpoint::FailpointRegistry;
use crate::fs::{AppendableFile, FileSystem};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Failpoint checked before `create`.
pub const FP_CREATE: &str = "fs_create";
/// Failpoint checked before every `append`.
pub const FP_APPEND: &str = "fs_append";
/// Failpoint checked before `delete`.
pub const FP_DELETE: &str = "fs_delete";
/// Failpoint checked before `mkdirs`.
pub const FP_MKDIRS: &str = "fs_mkdirs";

type FileData = Arc<Mutex<Vec<u8>>>;

#[derive(Default)]
struct State {
    files: BTreeMap<PathBuf, FileData>,
    dirs: BTreeSet<PathBuf>,
    deletes: HashMap<PathBuf, u32>,
}

/// A [`FileSystem`] kept entirely in memory.
///
/// Creating a file requires its parent directory to exist, matching what a
/// real file system would report. Every operation checks a failpoint first
/// (see [`FP_CREATE`], [`FP_APPEND`], [`FP_DELETE`], [`FP_MKDIRS`]).
#[derive(Default)]
pub struct InMemoryFileSystem {
    state: Mutex<State>,
    failpoints: Arc<FailpointRegistry>,
}

impl std::fmt::Debug for InMemoryFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryFileSystem")
            .field("files", &state.files.len())
            .field("dirs", &state.dirs.len())
            .finish()
    }
}

impl InMemoryFileSystem {
    /// Create an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Failpoints consulted by this file system.
    pub fn failpoints(&self) -> &FailpointRegistry {
        &self.failpoints
    }

    /// Full contents of a file.
    pub fn read(&self, path: &Path) -> Option<Vec<u8>> {
        let data = self.state.lock().files.get(path).cloned()?;
        let bytes = data.lock().clone();
        Some(bytes)
    }

    /// A byte range of a file, `None` if the file or range does not exist.
    pub fn read_range(&self, path: &Path, offset: u64, length: u64) -> Option<Vec<u8>> {
        let bytes = self.read(path)?;
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(length).ok()?)?;
        bytes.get(start..end).map(<[u8]>::to_vec)
    }

    /// Paths of all files below `dir`.
    pub fn files_in(&self, dir: &Path) -> Vec<PathBuf> {
        self.state
            .lock()
            .files
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect()
    }

    /// Number of files currently stored.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Number of successful deletions of `path`.
    pub fn delete_count(&self, path: &Path) -> u32 {
        self.state.lock().deletes.get(path).copied().unwrap_or(0)
    }

    /// Insert a file directly, bypassing failpoints. Parents are created.
    pub fn put_file(&self, path: &Path, contents: &[u8]) {
        let mut state = self.state.lock();
        if let Some(parent) = path.parent() {
            insert_dirs(&mut state.dirs, parent);
        }
        state
            .files
            .insert(path.to_path_buf(), Arc::new(Mutex::new(contents.to_vec())));
    }
}

fn insert_dirs(dirs: &mut BTreeSet<PathBuf>, path: &Path) {
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() {
            continue;
        }
        dirs.insert(ancestor.to_path_buf());
    }
}

struct InMemoryAppendableFile {
    data: FileData,
    failpoints: Arc<FailpointRegistry>,
}

impl AppendableFile for InMemoryAppendableFile {
    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        self.failpoints.check(FP_APPEND)?;
        self.data.lock().extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

impl FileSystem for InMemoryFileSystem {
    fn create(&self, path: &Path) -> io::Result<Box<dyn AppendableFile>> {
        self.failpoints.check(FP_CREATE)?;

        let mut state = self.state.lock();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !state.dirs.contains(parent) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("parent directory of {} does not exist", path.display()),
                ));
            }
        }
        if state.files.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }

        let data: FileData = Arc::new(Mutex::new(Vec::new()));
        state.files.insert(path.to_path_buf(), data.clone());
        Ok(Box::new(InMemoryAppendableFile {
            data,
            failpoints: self.failpoints.clone(),
        }))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        self.failpoints.check(FP_DELETE)?;

        let mut state = self.state.lock();
        if state.files.remove(path).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        *state.deletes.entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        let state = self.state.lock();
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    fn mkdirs(&self, path: &Path) -> io::Result<()> {
        self.failpoints.check(FP_MKDIRS)?;
        insert_dirs(&mut self.state.lock().dirs, path);
        Ok(())
    }
}
