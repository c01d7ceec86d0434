//! Per-subtask checkpoint state machines.
//!
//! ```text
//! Pending ──complete──> Completed ──subsume──> Subsumed
//!    │
//!    └──abort──> Aborted
//! ```
//!
//! Aborted and Subsumed checkpoints no longer hold references on their
//! segments. Every transition method returns the checkpoints whose references
//! must now be dropped; the caller releases them.

use crate::types::{CheckpointId, SubtaskKey};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// State of one checkpoint for one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointState {
    Pending,
    Completed,
    Aborted,
    Subsumed,
}

impl CheckpointState {
    /// Whether the checkpoint's segment references have been dropped.
    pub fn is_released(&self) -> bool {
        matches!(self, CheckpointState::Aborted | CheckpointState::Subsumed)
    }
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointState::Pending => write!(f, "pending"),
            CheckpointState::Completed => write!(f, "completed"),
            CheckpointState::Aborted => write!(f, "aborted"),
            CheckpointState::Subsumed => write!(f, "subsumed"),
        }
    }
}

#[derive(Debug, Default)]
struct SubtaskCheckpoints {
    states: BTreeMap<CheckpointId, CheckpointState>,
    /// Highest explicitly subsumed checkpoint. Anything unknown at or below it
    /// counts as subsumed.
    watermark: Option<CheckpointId>,
}

impl SubtaskCheckpoints {
    fn below_watermark(&self, checkpoint_id: CheckpointId) -> bool {
        self.watermark.is_some_and(|w| checkpoint_id <= w)
    }

    fn state(&self, checkpoint_id: CheckpointId) -> Option<CheckpointState> {
        match self.states.get(&checkpoint_id) {
            Some(state) => Some(*state),
            None if self.below_watermark(checkpoint_id) => Some(CheckpointState::Subsumed),
            None => None,
        }
    }

    fn prune(&mut self) {
        if let Some(watermark) = self.watermark {
            self.states
                .retain(|id, state| *id > watermark || !state.is_released());
        }
    }
}

/// Tracks checkpoint notifications for every subtask.
#[derive(Debug, Default)]
pub struct CheckpointLifecycleTracker {
    subtasks: DashMap<SubtaskKey, SubtaskCheckpoints>,
}

impl CheckpointLifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that data is being written for a checkpoint.
    ///
    /// Unknown checkpoints above the watermark become Pending. Returns the
    /// state after the call.
    pub fn begin(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> CheckpointState {
        let mut entry = self.subtasks.entry(subtask.clone()).or_default();
        if let Some(state) = entry.state(checkpoint_id) {
            return state;
        }
        entry.states.insert(checkpoint_id, CheckpointState::Pending);
        CheckpointState::Pending
    }

    /// Current state, `None` for checkpoints never seen.
    pub fn state(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> Option<CheckpointState> {
        self.subtasks
            .get(subtask)
            .and_then(|entry| entry.state(checkpoint_id))
    }

    pub fn is_released(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> bool {
        self.state(subtask, checkpoint_id)
            .is_some_and(|state| state.is_released())
    }

    /// Whether any notification has been seen for the checkpoint.
    pub fn is_notified(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> bool {
        self.state(subtask, checkpoint_id)
            .is_some_and(|state| state != CheckpointState::Pending)
    }

    /// Mark a checkpoint completed. Pending checkpoints below it are subsumed
    /// and returned.
    pub fn complete(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> Vec<CheckpointId> {
        let mut entry = self.subtasks.entry(subtask.clone()).or_default();
        if !entry.states.contains_key(&checkpoint_id) && entry.below_watermark(checkpoint_id) {
            return Vec::new();
        }
        match entry.state(checkpoint_id) {
            Some(CheckpointState::Pending) | None => {}
            Some(CheckpointState::Completed) => return Vec::new(),
            Some(state) => {
                warn!(%subtask, checkpoint_id, %state, "Ignoring completion of released checkpoint");
                return Vec::new();
            }
        }
        entry.states.insert(checkpoint_id, CheckpointState::Completed);

        let subsumed: Vec<CheckpointId> = entry
            .states
            .range_mut(..checkpoint_id)
            .filter(|(_, state)| **state == CheckpointState::Pending)
            .map(|(id, state)| {
                *state = CheckpointState::Subsumed;
                *id
            })
            .collect();

        debug!(%subtask, checkpoint_id, ?subsumed, "Checkpoint completed");
        subsumed
    }

    /// Mark a pending checkpoint aborted. Returns it if its references must be dropped.
    pub fn abort(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> Vec<CheckpointId> {
        let mut entry = self.subtasks.entry(subtask.clone()).or_default();
        match entry.state(checkpoint_id) {
            Some(CheckpointState::Pending) | None => {
                entry.states.insert(checkpoint_id, CheckpointState::Aborted);
                debug!(%subtask, checkpoint_id, "Checkpoint aborted");
                vec![checkpoint_id]
            }
            Some(CheckpointState::Completed) => {
                warn!(%subtask, checkpoint_id, "Ignoring abort of completed checkpoint");
                Vec::new()
            }
            Some(_) => Vec::new(),
        }
    }

    /// Subsume a checkpoint and every unreleased checkpoint below it.
    pub fn subsume(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) -> Vec<CheckpointId> {
        let mut entry = self.subtasks.entry(subtask.clone()).or_default();
        if entry.below_watermark(checkpoint_id) {
            return Vec::new();
        }

        let subsumed: Vec<CheckpointId> = entry
            .states
            .range_mut(..=checkpoint_id)
            .filter(|(_, state)| !state.is_released())
            .map(|(id, state)| {
                *state = CheckpointState::Subsumed;
                *id
            })
            .collect();

        entry.watermark = Some(checkpoint_id);
        entry.prune();

        debug!(%subtask, checkpoint_id, ?subsumed, "Checkpoint subsumed");
        subsumed
    }

    /// Record a checkpoint restored from durable storage as completed.
    pub fn restore(&self, subtask: &SubtaskKey, checkpoint_id: CheckpointId) {
        let mut entry = self.subtasks.entry(subtask.clone()).or_default();
        if entry.state(checkpoint_id).is_none() {
            entry.states.insert(checkpoint_id, CheckpointState::Completed);
        }
    }

    /// Drop all state of a subtask that will not be notified again.
    pub fn forget(&self, subtask: &SubtaskKey) {
        if self.subtasks.remove(subtask).is_some() {
            debug!(%subtask, "Dropped checkpoint states of subtask");
        }
    }

    pub fn is_tracked(&self, subtask: &SubtaskKey) -> bool {
        self.subtasks.contains_key(subtask)
    }

    /// Number of checkpoints with an explicit entry for the subtask.
    pub fn tracked_count(&self, subtask: &SubtaskKey) -> usize {
        self.subtasks
            .get(subtask)
            .map(|entry| entry.states.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask() -> SubtaskKey {
        SubtaskKey::new("job", "op", 0, 1)
    }

    #[test]
    fn test_complete_subsumes_lower_pending() {
        let tracker = CheckpointLifecycleTracker::new();
        let key = subtask();
        for id in 1..=5 {
            tracker.begin(&key, id);
        }

        assert_eq!(tracker.complete(&key, 5), vec![1, 2, 3, 4]);
        assert_eq!(tracker.state(&key, 5), Some(CheckpointState::Completed));
        assert_eq!(tracker.state(&key, 2), Some(CheckpointState::Subsumed));

        // Idempotent.
        assert!(tracker.complete(&key, 5).is_empty());
    }

    #[test]
    fn test_complete_keeps_completed_below() {
        let tracker = CheckpointLifecycleTracker::new();
        let key = subtask();
        tracker.begin(&key, 1);
        tracker.complete(&key, 1);
        tracker.begin(&key, 2);

        assert!(tracker.complete(&key, 2).is_empty());
        assert_eq!(tracker.state(&key, 1), Some(CheckpointState::Completed));
    }

    #[test]
    fn test_abort() {
        let tracker = CheckpointLifecycleTracker::new();
        let key = subtask();
        tracker.begin(&key, 1);
        tracker.begin(&key, 2);

        assert_eq!(tracker.abort(&key, 1), vec![1]);
        assert!(tracker.abort(&key, 1).is_empty());
        assert!(tracker.is_released(&key, 1));

        tracker.complete(&key, 2);
        assert!(tracker.abort(&key, 2).is_empty());
        assert_eq!(tracker.state(&key, 2), Some(CheckpointState::Completed));
    }

    #[test]
    fn test_complete_after_abort_is_ignored() {
        let tracker = CheckpointLifecycleTracker::new();
        let key = subtask();
        tracker.abort(&key, 3);

        assert!(tracker.complete(&key, 3).is_empty());
        assert_eq!(tracker.state(&key, 3), Some(CheckpointState::Aborted));
    }

    #[test]
    fn test_subsume_prefix_and_watermark() {
        let tracker = CheckpointLifecycleTracker::new();
        let key = subtask();
        tracker.begin(&key, 1);
        tracker.complete(&key, 1);
        tracker.begin(&key, 2);
        tracker.abort(&key, 2);
        tracker.begin(&key, 3);
        tracker.complete(&key, 3);
        tracker.begin(&key, 4);

        assert_eq!(tracker.subsume(&key, 3), vec![1, 3]);
        assert!(tracker.subsume(&key, 3).is_empty());
        assert!(tracker.subsume(&key, 2).is_empty());

        // Released entries at or below the watermark are pruned.
        assert_eq!(tracker.tracked_count(&key), 1);
        assert_eq!(tracker.state(&key, 2), Some(CheckpointState::Subsumed));
        assert_eq!(tracker.state(&key, 4), Some(CheckpointState::Pending));

        // Unknown ids below the watermark are no-ops.
        assert!(tracker.abort(&key, 1).is_empty());
        assert!(tracker.complete(&key, 0).is_empty());
        assert_eq!(tracker.begin(&key, 2), CheckpointState::Subsumed);
    }

    #[test]
    fn test_subtasks_are_independent() {
        let tracker = CheckpointLifecycleTracker::new();
        let a = SubtaskKey::new("job", "op", 0, 2);
        let b = SubtaskKey::new("job", "op", 1, 2);
        tracker.begin(&a, 1);
        tracker.begin(&b, 1);

        tracker.abort(&a, 1);
        assert!(tracker.is_released(&a, 1));
        assert_eq!(tracker.state(&b, 1), Some(CheckpointState::Pending));
    }

    #[test]
    fn test_restore_marks_completed() {
        let tracker = CheckpointLifecycleTracker::new();
        let key = subtask();
        tracker.restore(&key, 7);
        tracker.restore(&key, 7);

        assert_eq!(tracker.state(&key, 7), Some(CheckpointState::Completed));
        assert!(tracker.is_notified(&key, 7));
        assert_eq!(tracker.subsume(&key, 7), vec![7]);
    }

    #[test]
    fn test_forget() {
        let tracker = CheckpointLifecycleTracker::new();
        let key = subtask();
        tracker.begin(&key, 1);
        tracker.complete(&key, 1);
        assert!(tracker.is_tracked(&key));

        tracker.forget(&key);
        assert!(!tracker.is_tracked(&key));
        assert_eq!(tracker.state(&key, 1), None);
        tracker.forget(&key);
    }
}
