//! Local file system implementation backed by `std::fs`.

use super::{AppendableFile, FileSystem};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// [`FileSystem`] over the local disk.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    /// Call `sync_data` on every flush.
    sync_on_flush: bool,
}

impl LocalFileSystem {
    /// Create a local file system that does not force syncs on flush.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force `sync_data` whenever a file is flushed or closed.
    pub fn with_sync_on_flush(mut self, sync: bool) -> Self {
        self.sync_on_flush = sync;
        self
    }
}

struct LocalAppendableFile {
    file: File,
    sync_on_flush: bool,
}

impl AppendableFile for LocalAppendableFile {
    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.sync_on_flush {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.flush()
    }
}

impl FileSystem for LocalFileSystem {
    fn create(&self, path: &Path) -> io::Result<Box<dyn AppendableFile>> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;
        Ok(Box::new(LocalAppendableFile {
            file,
            sync_on_flush: self.sync_on_flush,
        }))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn mkdirs(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_append_close() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new().with_sync_on_flush(true);
        let path = dir.path().join("file");

        let mut file = fs.create(&path).unwrap();
        file.append(b"hello ").unwrap();
        file.append(b"world").unwrap();
        file.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert!(fs.exists(&path).unwrap());
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let path = dir.path().join("file");

        fs.create(&path).unwrap().close().unwrap();
        assert!(fs.create(&path).is_err());
    }

    #[test]
    fn test_mkdirs_and_delete() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let nested = dir.path().join("a").join("b");

        fs.mkdirs(&nested).unwrap();
        fs.mkdirs(&nested).unwrap();
        assert!(fs.exists(&nested).unwrap());

        let path = nested.join("file");
        fs.create(&path).unwrap().close().unwrap();
        fs.delete(&path).unwrap();
        assert!(!fs.exists(&path).unwrap());
        assert!(fs.delete(&path).is_err());
    }
}
