//! Named failure triggers for the in-memory file system.
//!
//! [`InMemoryFileSystem`](super::InMemoryFileSystem) consults a named
//! failpoint before each operation; a firing failpoint surfaces as an
//! `io::Error` from that operation. Failpoints may be armed and cleared
//! while other threads are writing.
//!
//! # Example
//!
//! ```rust
//! use filemerge::testing::{FailpointAction, FailpointRegistry};
//!
//! let registry = FailpointRegistry::new();
//! registry.enable("fs_delete", FailpointAction::Once);
//!
//! assert!(registry.check("fs_delete").is_err());
//! assert!(registry.check("fs_delete").is_ok());
//! ```

use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// When an armed failpoint fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailpointAction {
    /// Every hit.
    Always,
    /// The first hit only.
    Once,
    /// Hit `n` and every hit after it.
    After(u64),
    /// Every `n`th hit.
    EveryN(u64),
}

impl FailpointAction {
    /// Whether the `hit`th check fires, given how often it already fired.
    fn fires(self, hit: u64, fired: u64) -> bool {
        match self {
            FailpointAction::Always => true,
            FailpointAction::Once => fired == 0,
            FailpointAction::After(n) => hit >= n,
            FailpointAction::EveryN(n) => n > 0 && hit % n == 0,
        }
    }
}

#[derive(Debug)]
struct Armed {
    action: FailpointAction,
    hits: AtomicU64,
    fired: AtomicU64,
}

/// Set of armed failpoints, keyed by name.
#[derive(Debug, Default)]
pub struct FailpointRegistry {
    armed: DashMap<String, Arc<Armed>>,
}

impl FailpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `name`, resetting its counters.
    pub fn enable(&self, name: &str, action: FailpointAction) {
        self.armed.insert(
            name.to_string(),
            Arc::new(Armed {
                action,
                hits: AtomicU64::new(0),
                fired: AtomicU64::new(0),
            }),
        );
    }

    pub fn disable(&self, name: &str) {
        self.armed.remove(name);
    }

    /// Record a hit on `name` and return an injected error if it fires.
    pub fn check(&self, name: &str) -> io::Result<()> {
        let Some(armed) = self.armed.get(name).map(|entry| entry.value().clone()) else {
            return Ok(());
        };

        let hit = armed.hits.fetch_add(1, Ordering::Relaxed) + 1;
        let fires = match armed.action {
            // Claim the single firing atomically so concurrent hits cannot both fail.
            FailpointAction::Once => armed
                .fired
                .compare_exchange(0, 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok(),
            action => {
                let fires = action.fires(hit, armed.fired.load(Ordering::Relaxed));
                if fires {
                    armed.fired.fetch_add(1, Ordering::Relaxed);
                }
                fires
            }
        };

        if fires {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure at {name} (hit {hit})"),
            ))
        } else {
            Ok(())
        }
    }

    /// How many times `name` fired since it was armed.
    pub fn triggered(&self, name: &str) -> u64 {
        self.armed
            .get(name)
            .map(|armed| armed.fired.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
