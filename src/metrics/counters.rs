//! Monotonic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter with a Prometheus name.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a counter starting at zero.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
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
        self.inc_by(1);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Append this counter in Prometheus exposition format.
    pub fn write_prometheus(&self, out: &mut String) {
        super::write_header(out, self.name, self.help, "counter");
        out.push_str(&format!("{} {}\n", self.name, self.get()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("segments_total", "Segments written");
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);

        let mut out = String::new();
        counter.write_prometheus(&mut out);
        assert_eq!(
            out,
            "# HELP segments_total Segments written\n# TYPE segments_total counter\nsegments_total 6\n"
        );
    }
}
