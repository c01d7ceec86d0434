//! Space accounting for managed directories.

use crate::metrics::{write_header, Gauge};
use crate::types::CheckpointScope;
use std::fmt;

/// Space usage of one managed scope.
///
/// The four gauges are updated independently with relaxed atomics, so a
/// reader may observe them mid-update. Callers keep `logical <= physical`
/// by growing the physical side first and shrinking the logical side first.
#[derive(Debug)]
pub struct SpaceStat {
    physical_file_count: Gauge,
    physical_file_size: Gauge,
    logical_file_count: Gauge,
    logical_file_size: Gauge,
}

impl Default for SpaceStat {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceStat {
    pub const fn new() -> Self {
        Self {
            physical_file_count: Gauge::new(
                "filemerge_physical_file_count",
                "Physical files alive",
            ),
            physical_file_size: Gauge::new(
                "filemerge_physical_file_bytes",
                "Bytes held by physical files, including dead bytes",
            ),
            logical_file_count: Gauge::new(
                "filemerge_logical_file_count",
                "Live logical segments",
            ),
            logical_file_size: Gauge::new(
                "filemerge_logical_file_bytes",
                "Bytes held by live logical segments",
            ),
        }
    }

    pub fn on_logical_file_create(&self, size: u64) {
        self.logical_file_size.add(size as i64);
        self.logical_file_count.inc();
    }

    pub fn on_logical_file_delete(&self, size: u64) {
        self.logical_file_size.sub(size as i64);
        self.logical_file_count.dec();
    }

    pub fn on_physical_file_create(&self) {
        self.physical_file_count.inc();
    }

    pub fn on_physical_file_update(&self, delta: u64) {
        self.physical_file_size.add(delta as i64);
    }

    pub fn on_physical_file_delete(&self, size: u64) {
        self.physical_file_size.sub(size as i64);
        self.physical_file_count.dec();
    }

    /// `logical / physical`, or 1.0 while nothing has been written.
    pub fn live_fraction(&self) -> f64 {
        self.snapshot().live_fraction()
    }

    pub fn snapshot(&self) -> SpaceStatSnapshot {
        SpaceStatSnapshot {
            physical_file_count: self.physical_file_count.get(),
            physical_file_size: self.physical_file_size.get(),
            logical_file_count: self.logical_file_count.get(),
            logical_file_size: self.logical_file_size.get(),
        }
    }

    fn gauges(&self) -> [&Gauge; 4] {
        [
            &self.physical_file_count,
            &self.physical_file_size,
            &self.logical_file_count,
            &self.logical_file_size,
        ]
    }
}

/// Point-in-time copy of a [`SpaceStat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStatSnapshot {
    pub physical_file_count: i64,
    pub physical_file_size: i64,
    pub logical_file_count: i64,
    pub logical_file_size: i64,
}

impl SpaceStatSnapshot {
    /// `logical / physical`, or 1.0 while nothing has been written.
    pub fn live_fraction(&self) -> f64 {
        if self.physical_file_size <= 0 {
            1.0
        } else {
            self.logical_file_size as f64 / self.physical_file_size as f64
        }
    }

    /// Bytes in physical files not covered by any live segment.
    pub fn wasted_size(&self) -> i64 {
        self.physical_file_size - self.logical_file_size
    }
}

impl fmt::Display for SpaceStatSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpaceStat{{physicalFileCount={}, physicalFileSize={}, logicalFileCount={}, logicalFileSize={}}}",
            self.physical_file_count,
            self.physical_file_size,
            self.logical_file_count,
            self.logical_file_size
        )
    }
}

/// Per-scope space statistics of the engine.
#[derive(Debug, Default)]
pub struct SpaceAccountant {
    shared: SpaceStat,
    exclusive: SpaceStat,
}

impl SpaceAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_scope(&self, scope: CheckpointScope) -> &SpaceStat {
        match scope {
            CheckpointScope::Shared => &self.shared,
            CheckpointScope::Exclusive => &self.exclusive,
        }
    }

    /// Render both scopes in Prometheus text format, labelled by `scope`.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let scopes = [CheckpointScope::Shared, CheckpointScope::Exclusive];
        for (i, family) in self.shared.gauges().iter().enumerate() {
            write_header(&mut out, family.name(), family.help(), "gauge");
            for scope in scopes {
                let gauge = self.for_scope(scope).gauges()[i];
                gauge.write_sample(&mut out, &format!("scope=\"{}\"", scope));
            }
        }
        out
    }
}
