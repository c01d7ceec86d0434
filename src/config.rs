//! Configuration types for the file-merging engine.

use crate::error::{Error, Result};

/// Default maximum size of a physical file before it is rolled (32 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 32 * 1024 * 1024;

/// Default number of open shared-state physical files per subtask.
pub const DEFAULT_SHARED_POOL_SIZE: usize = 4;

/// Default minimum fraction of live bytes required for reuse.
pub const DEFAULT_MIN_LIVE_FRACTION: f64 = 0.5;

/// Default write buffer size for segment output streams (4 KiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024;

/// How physical files are shared between checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileMergingType {
    /// Segments of different checkpoints are appended to the same physical file.
    #[default]
    AcrossCheckpoints,
    /// Every checkpoint gets its own physical files; they are sealed once the
    /// checkpoint is completed, aborted or subsumed.
    WithinCheckpoint,
}

/// Configuration for the file-merging snapshot manager.
#[derive(Debug, Clone)]
pub struct FileMergingConfig {
    /// Whether physical files may hold segments of several checkpoints.
    pub merging_type: FileMergingType,

    /// A physical file at or above this size is sealed instead of being
    /// returned to its pool.
    pub max_file_size: u64,

    /// Maximum number of open shared-state physical files per pool.
    /// Exclusive state always uses a single open file.
    pub shared_pool_size: usize,

    /// Minimum `logical / physical` byte ratio of a scope for which a
    /// previous segment may still be reused.
    pub min_live_fraction: f64,

    /// Write buffer size used when `init_file_system` is given 0.
    pub default_write_buffer_size: usize,
}

impl Default for FileMergingConfig {
    fn default() -> Self {
        Self {
            merging_type: FileMergingType::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            shared_pool_size: DEFAULT_SHARED_POOL_SIZE,
            min_live_fraction: DEFAULT_MIN_LIVE_FRACTION,
            default_write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl FileMergingConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the merging type.
    pub fn with_merging_type(mut self, merging_type: FileMergingType) -> Self {
        self.merging_type = merging_type;
        self
    }

    /// Set the maximum physical file size.
    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Set the shared-state pool size.
    pub fn with_shared_pool_size(mut self, size: usize) -> Self {
        self.shared_pool_size = size;
        self
    }

    /// Set the minimum live fraction for reuse.
    pub fn with_min_live_fraction(mut self, fraction: f64) -> Self {
        self.min_live_fraction = fraction;
        self
    }

    /// Set the maximum space amplification (`physical / logical`) accepted
    /// for reuse. Equivalent to a minimum live fraction of `1 / amplification`.
    pub fn with_max_space_amplification(mut self, amplification: f64) -> Self {
        self.min_live_fraction = if amplification > 0.0 {
            1.0 / amplification
        } else {
            f64::INFINITY
        };
        self
    }

    /// Set the default write buffer size.
    pub fn with_default_write_buffer_size(mut self, size: usize) -> Self {
        self.default_write_buffer_size = size;
        self
    }

    /// Check that all values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(Error::Config("max_file_size must be positive".into()));
        }
        if self.shared_pool_size == 0 {
            return Err(Error::Config("shared_pool_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.min_live_fraction) {
            return Err(Error::Config(format!(
                "min_live_fraction must be within [0, 1], got {}",
                self.min_live_fraction
            )));
        }
        if self.default_write_buffer_size == 0 {
            return Err(Error::Config(
                "default_write_buffer_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FileMergingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.merging_type, FileMergingType::AcrossCheckpoints);
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
    }

    #[test]
    fn test_builder() {
        let config = FileMergingConfig::new()
            .with_merging_type(FileMergingType::WithinCheckpoint)
            .with_max_file_size(1024)
            .with_shared_pool_size(2)
            .with_max_space_amplification(4.0);

        assert_eq!(config.merging_type, FileMergingType::WithinCheckpoint);
        assert_eq!(config.max_file_size, 1024);
        assert_eq!(config.shared_pool_size, 2);
        assert!((config.min_live_fraction - 0.25).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        assert!(FileMergingConfig::new()
            .with_max_file_size(0)
            .validate()
            .is_err());
        assert!(FileMergingConfig::new()
            .with_shared_pool_size(0)
            .validate()
            .is_err());
        assert!(FileMergingConfig::new()
            .with_min_live_fraction(1.5)
            .validate()
            .is_err());
        assert!(FileMergingConfig::new()
            .with_max_space_amplification(0.0)
            .validate()
            .is_err());
    }
}
