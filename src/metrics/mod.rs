//! Metrics for monitoring the file-merging engine.
//!
//! - Counters for segments, bytes and physical file churn
//! - Gauges backing the per-scope [`SpaceStat`](crate::filemerging::SpaceStat)
//! - Prometheus text exposition of both
//!
//! # Example
//!
//! ```rust,ignore
//! let snapshot = manager.metrics();
//! println!("reuse hit rate: {:.2}%", snapshot.reuse_rate() * 100.0);
//!
//! // Serve from a /metrics endpoint
//! let body = manager.prometheus_text();
//! ```

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::Gauge;

/// Append the `# HELP` and `# TYPE` lines of a metric family.
pub(crate) fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {} {}\n", name, help));
    out.push_str(&format!("# TYPE {} {}\n", name, kind));
}

/// Counters describing the engine's activity since startup.
#[derive(Debug)]
pub struct FileMergingMetrics {
    /// Logical segments registered by closed streams.
    pub segments_written: Counter,
    /// Bytes appended to physical files.
    pub bytes_written: Counter,
    /// Physical files created.
    pub physical_files_created: Counter,
    /// Physical files deleted from the file system.
    pub physical_files_reclaimed: Counter,
    /// Failed physical file deletions (retried later).
    pub delete_failures: Counter,
    /// Failed creates or appends.
    pub write_failures: Counter,
    /// Reuse checks that allowed reuse.
    pub reuse_accepted: Counter,
    /// Reuse checks that refused reuse.
    pub reuse_refused: Counter,
    /// Segments re-registered from restored checkpoints.
    pub segments_restored: Counter,
}

impl Default for FileMergingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FileMergingMetrics {
    /// Create a new metrics set with all counters at zero.
    pub const fn new() -> Self {
        Self {
            segments_written: Counter::new(
                "filemerge_segments_written_total",
                "Logical segments written",
            ),
            bytes_written: Counter::new(
                "filemerge_bytes_written_total",
                "Bytes appended to physical files",
            ),
            physical_files_created: Counter::new(
                "filemerge_physical_files_created_total",
                "Physical files created",
            ),
            physical_files_reclaimed: Counter::new(
                "filemerge_physical_files_reclaimed_total",
                "Physical files deleted",
            ),
            delete_failures: Counter::new(
                "filemerge_delete_failures_total",
                "Physical file deletions that failed",
            ),
            write_failures: Counter::new(
                "filemerge_write_failures_total",
                "Physical file creates or appends that failed",
            ),
            reuse_accepted: Counter::new(
                "filemerge_reuse_accepted_total",
                "Reuse checks that allowed reuse",
            ),
            reuse_refused: Counter::new(
                "filemerge_reuse_refused_total",
                "Reuse checks that refused reuse",
            ),
            segments_restored: Counter::new(
                "filemerge_segments_restored_total",
                "Segments re-registered on restore",
            ),
        }
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            segments_written: self.segments_written.get(),
            bytes_written: self.bytes_written.get(),
            physical_files_created: self.physical_files_created.get(),
            physical_files_reclaimed: self.physical_files_reclaimed.get(),
            delete_failures: self.delete_failures.get(),
            write_failures: self.write_failures.get(),
            reuse_accepted: self.reuse_accepted.get(),
            reuse_refused: self.reuse_refused.get(),
            segments_restored: self.segments_restored.get(),
        }
    }

    fn counters(&self) -> [&Counter; 9] {
        [
            &self.segments_written,
            &self.bytes_written,
            &self.physical_files_created,
            &self.physical_files_reclaimed,
            &self.delete_failures,
            &self.write_failures,
            &self.reuse_accepted,
            &self.reuse_refused,
            &self.segments_restored,
        ]
    }

    /// Render all counters in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for counter in self.counters() {
            counter.write_prometheus(&mut out);
        }
        out
    }
}

/// Point-in-time copy of [`FileMergingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub segments_written: u64,
    pub bytes_written: u64,
    pub physical_files_created: u64,
    pub physical_files_reclaimed: u64,
    pub delete_failures: u64,
    pub write_failures: u64,
    pub reuse_accepted: u64,
    pub reuse_refused: u64,
    pub segments_restored: u64,
}

impl MetricsSnapshot {
    /// Fraction of reuse checks that allowed reuse.
    pub fn reuse_rate(&self) -> f64 {
        let total = self.reuse_accepted + self.reuse_refused;
        if total == 0 {
            0.0
        } else {
            self.reuse_accepted as f64 / total as f64
        }
    }

    /// Average number of segments per created physical file.
    pub fn segments_per_file(&self) -> f64 {
        if self.physical_files_created == 0 {
            0.0
        } else {
            self.segments_written as f64 / self.physical_files_created as f64
        }
    }
}
