//! Output stream writing one logical segment.

use super::manager::ManagerInner;
use super::physical_file::PhysicalFile;
use super::pool::PoolKey;
use super::segment::SegmentHandle;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::types::CheckpointId;
use bytes::BytesMut;
use std::io::{self, Write};
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

/// Buffered writer appending one segment to a claimed physical file.
///
/// The segment starts at the file's offset when the stream was created. Call
/// [`close_and_get_handle`](Self::close_and_get_handle) to obtain the handle.
/// A stream dropped without closing gives its file back if nothing reached
/// it; otherwise the file is sealed, since the bytes cannot be taken back.
///
/// After a failed write the file is sealed and abandoned, and every further
/// call fails.
pub struct SegmentOutputStream {
    inner: Arc<ManagerInner>,
    fs: Arc<dyn FileSystem>,
    key: PoolKey,
    checkpoint_id: CheckpointId,
    file: Option<Arc<PhysicalFile>>,
    path: PathBuf,
    start: u64,
    written: u64,
    buffer: BytesMut,
    buffer_size: usize,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, Error::StreamClosed)
}

impl SegmentOutputStream {
    pub(crate) fn new(
        inner: Arc<ManagerInner>,
        fs: Arc<dyn FileSystem>,
        key: PoolKey,
        checkpoint_id: CheckpointId,
        file: Arc<PhysicalFile>,
        buffer_size: usize,
    ) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            inner,
            fs,
            key,
            checkpoint_id,
            path: file.path().to_path_buf(),
            start: file.size(),
            file: Some(file),
            written: 0,
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size,
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    /// Physical file the segment is written to.
    pub fn file_path(&self) -> &std::path::Path {
        &self.path
    }

    /// Segment start offset in the physical file.
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    /// Bytes written so far, buffered ones included.
    pub fn len(&self) -> u64 {
        self.written + self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute position in the physical file.
    pub fn pos(&self) -> u64 {
        self.start + self.len()
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self.file.as_ref().ok_or_else(closed_error)?;
        match file.append(data) {
            Ok(()) => {
                self.written += data.len() as u64;
                self.inner.record_append(self.key.scope, data.len() as u64);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn fail(&mut self, error: &io::Error) {
        if let Some(file) = self.file.take() {
            self.inner.on_write_failure(self.fs.as_ref(), &file, error);
        }
        self.buffer.clear();
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = mem::take(&mut self.buffer);
        let result = self.append(&data);
        self.buffer = data;
        self.buffer.clear();
        result
    }

    /// Flush and finish the segment.
    ///
    /// Returns `None` if nothing was written; the file then goes back to its
    /// pool untouched.
    pub fn close_and_get_handle(mut self) -> Result<Option<SegmentHandle>> {
        if self.file.is_none() {
            return Err(Error::StreamClosed);
        }
        Write::flush(&mut self).map_err(|e| Error::write_failed(&self.path, e))?;

        let Some(file) = self.file.take() else {
            return Err(Error::StreamClosed);
        };
        if self.written == 0 {
            self.inner.return_file(self.fs.as_ref(), &self.key, file);
            return Ok(None);
        }
        let handle = self.inner.finish_segment(
            self.fs.as_ref(),
            &self.key,
            file,
            self.checkpoint_id,
            self.start,
            self.written,
        );
        Ok(Some(handle))
    }
}

impl Write for SegmentOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.file.is_none() {
            return Err(closed_error());
        }
        if buf.len() >= self.buffer_size {
            self.flush_buffer()?;
            self.append(buf)?;
        } else {
            if self.buffer.len() + buf.len() > self.buffer_size {
                self.flush_buffer()?;
            }
            self.buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        let file = self.file.as_ref().ok_or_else(closed_error)?;
        if let Err(e) = file.flush() {
            self.fail(&e);
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for SegmentOutputStream {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.inner
                .abandon(self.fs.as_ref(), &self.key, file, self.written);
        }
    }
}

impl std::fmt::Debug for SegmentOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentOutputStream")
            .field("path", &self.path)
            .field("checkpoint_id", &self.checkpoint_id)
            .field("start", &self.start)
            .field("len", &self.len())
            .finish()
    }
}
