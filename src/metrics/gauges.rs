//! Gauges for values that move both ways.

use std::sync::atomic::{AtomicI64, Ordering};

/// A signed gauge with a Prometheus name.
///
/// Updates use relaxed atomics; readers of several gauges get no
/// cross-gauge snapshot guarantee.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a gauge starting at zero.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    /// Get the metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Decrement by one.
    pub fn dec(&self) {
        self.sub(1);
    }

    /// Add `n`.
    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtract `n`.
    pub fn sub(&self, n: i64) {
        self.value.fetch_sub(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Append one labelled sample, e.g. `name{scope="shared"} 42`.
    ///
    /// The family header is written separately so several label sets can
    /// share it.
    pub fn write_sample(&self, out: &mut String, labels: &str) {
        if labels.is_empty() {
            out.push_str(&format!("{} {}\n", self.name, self.get()));
        } else {
            out.push_str(&format!("{}{{{}}} {}\n", self.name, labels, self.get()));
        }
    }
}
