//! Error types for the file-merging engine.

use crate::types::{CheckpointScope, SubtaskKey};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for file-merging operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the file-merging engine.
#[derive(Error, Debug)]
pub enum Error {
    /// `init_file_system` was called again with a different directory layout.
    #[error("configuration conflict on {field}: initialized with {existing}, requested {requested}")]
    ConfigurationConflict {
        field: &'static str,
        existing: String,
        requested: String,
    },

    /// The file system has not been initialized yet.
    #[error("file system not initialized")]
    NotInitialized,

    /// The subtask has no managed directory for the requested scope.
    #[error("subtask {subtask} not registered for {scope} state")]
    NotRegistered {
        subtask: SubtaskKey,
        scope: CheckpointScope,
    },

    /// Creating or appending to a physical file failed.
    ///
    /// The physical file is sealed and abandoned; the checkpoint attempt
    /// that owned the stream should be failed by the caller.
    #[error("write to {} failed: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Restored handles do not match what exists on the file system.
    #[error("corrupted restore state: {0}")]
    CorruptedRestoreState(String),

    /// The stream or the manager was already closed.
    #[error("stream closed")]
    StreamClosed,

    /// Invalid configuration values.
    #[error("config error: {0}")]
    Config(String),

    /// Directory creation or existence checks.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Handle encoding or decoding.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub(crate) fn write_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::WriteFailed {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn conflict(
        field: &'static str,
        existing: impl std::fmt::Debug,
        requested: impl std::fmt::Debug,
    ) -> Self {
        Error::ConfigurationConflict {
            field,
            existing: format!("{existing:?}"),
            requested: format!("{requested:?}"),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
