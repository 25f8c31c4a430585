use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::model::SlotKey;

/// Slots already synchronized, keyed by `SlotKey`. Week numbers repeat
/// every academic year, so they are never used as the key. The set only
/// grows during a run.
#[derive(Debug, Default)]
pub struct OffsetDedupTracker {
    processed: Mutex<HashSet<SlotKey>>,
}

impl OffsetDedupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from slots recorded by earlier runs.
    pub fn with_processed(keys: impl IntoIterator<Item = SlotKey>) -> Self {
        Self {
            processed: Mutex::new(keys.into_iter().collect()),
        }
    }

    pub fn should_process(&self, slot_key: &str) -> bool {
        !self
            .processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(slot_key)
    }

    /// Call only once the slot's whole pipeline has finished.
    pub fn mark_processed(&self, slot_key: impl Into<SlotKey>) {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot_key.into());
    }

    pub fn len(&self) -> usize {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WeekControl;

    #[test]
    fn test_same_week_number_different_slot_keys() {
        let this_year = WeekControl {
            offset: 0,
            slot_key: "2025-W01".into(),
            week_number: 1,
            is_current: true,
        };
        let last_year = WeekControl {
            offset: -52,
            slot_key: "2024-W01".into(),
            week_number: 1,
            is_current: false,
        };

        let tracker = OffsetDedupTracker::new();
        assert!(tracker.should_process(&this_year.slot_key));
        tracker.mark_processed(this_year.slot_key.clone());
        assert!(tracker.should_process(&last_year.slot_key));
        assert!(!tracker.should_process(&this_year.slot_key));
    }

    #[test]
    fn test_seeded_tracker() {
        let tracker = OffsetDedupTracker::with_processed(vec!["B".to_string()]);
        assert!(tracker.should_process("A"));
        assert!(!tracker.should_process("B"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_mark_is_idempotent() {
        let tracker = OffsetDedupTracker::new();
        tracker.mark_processed("A");
        tracker.mark_processed("A");
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.is_empty());
    }
}
