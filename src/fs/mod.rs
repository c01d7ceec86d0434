//! File system abstraction consumed by the engine.
//!
//! The engine only needs to create append-only files, delete them, check
//! that they exist and create directories. Reads go through whatever the
//! state backend uses; a [`SegmentHandle`](crate::filemerging::SegmentHandle)
//! carries everything needed to locate the bytes.

mod local;

pub use local::LocalFileSystem;

use std::fmt::Debug;
use std::io;
use std::path::Path;

/// A file opened for appending.
///
/// Implementations are used by one writer at a time; the engine guarantees
/// that no two streams append to the same handle concurrently.
pub trait AppendableFile: Send {
    /// Append bytes at the end of the file.
    fn append(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Push buffered bytes down to durable storage.
    fn flush(&mut self) -> io::Result<()>;

    /// Flush and release the handle. No appends may follow.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// The file system the managed directories live on.
///
/// This trait is object-safe and shared as `Arc<dyn FileSystem>`.
pub trait FileSystem: Send + Sync + Debug {
    /// Create a new, empty file and open it for appending.
    fn create(&self, path: &Path) -> io::Result<Box<dyn AppendableFile>>;

    /// Delete a file.
    fn delete(&self, path: &Path) -> io::Result<()>;

    /// Check whether a file or directory exists.
    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Create a directory and all missing parents. Succeeds if it already exists.
    fn mkdirs(&self, path: &Path) -> io::Result<()>;
}
