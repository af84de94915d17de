use crate::projector::LifecycleState;
use crate::registry::PrinterId;
use std::collections::HashMap;

/// Edge detector for the transition into `Complete`.
///
/// History survives reconnects and disable/enable cycles; it is dropped
/// only when the printer record is removed.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    last_seen: HashMap<PrinterId, LifecycleState>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `state` for `printer_id`; true exactly on a non-complete →
    /// complete transition. The first observation of a printer only seeds
    /// the history.
    pub fn observe(&mut self, printer_id: PrinterId, state: LifecycleState) -> bool {
        match self.last_seen.insert(printer_id, state) {
            Some(previous) => {
                previous != LifecycleState::Complete && state == LifecycleState::Complete
            }
            None => false,
        }
    }

    pub fn last_seen(&self, printer_id: PrinterId) -> Option<LifecycleState> {
        self.last_seen.get(&printer_id).copied()
    }

    pub fn forget(&mut self, printer_id: PrinterId) {
        self.last_seen.remove(&printer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_fires_once_per_transition() {
        let mut tracker = CompletionTracker::new();
        assert!(!tracker.observe(1, Printing));
        assert!(tracker.observe(1, Complete));
        assert!(!tracker.observe(1, Complete));
        assert!(!tracker.observe(1, Complete));

        assert!(!tracker.observe(1, Ready));
        assert!(!tracker.observe(1, Printing));
        assert!(tracker.observe(1, Complete));
    }

    #[test]
    fn test_first_observation_seeds_silently() {
        let mut tracker = CompletionTracker::new();
        assert!(!tracker.observe(9, Complete));
        assert_eq!(tracker.last_seen(9), Some(Complete));
    }

    #[test]
    fn test_history_is_per_printer() {
        let mut tracker = CompletionTracker::new();
        tracker.observe(1, Printing);
        tracker.observe(2, Complete);
        assert!(tracker.observe(1, Complete));
        assert!(!tracker.observe(2, Complete));
    }

    #[test]
    fn test_forget_clears_history() {
        let mut tracker = CompletionTracker::new();
        tracker.observe(1, Printing);
        tracker.forget(1);
        assert!(tracker.last_seen(1).is_none());
        // Back to seeding behaviour
        assert!(!tracker.observe(1, Complete));
    }
}
