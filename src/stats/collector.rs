//! Append-only result collector shared by the tasks of one request.

use crate::governor::FailureClass;
use crate::types::SubscriptionEventTypeStats;
use parking_lot::Mutex;
use std::collections::HashMap;

/// What one event-type task produced.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TaskOutcome {
    /// Full or partial result; unreachable partitions are already `Unknown`.
    Resolved(SubscriptionEventTypeStats),
    /// Nothing usable was fetched.
    Failed { class: FailureClass, reason: String },
}

impl TaskOutcome {
    pub(crate) fn is_permanent(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Failed {
                class: FailureClass::Permanent,
                ..
            }
        )
    }
}

#[derive(Default)]
struct CollectorState {
    sealed: bool,
    results: HashMap<String, TaskOutcome>,
}

/// Results keyed by event type.
///
/// Each event type is recorded at most once. Once sealed the collector
/// refuses further results, so a task finishing after the deadline cannot
/// change a response that is already being assembled.
#[derive(Default)]
pub(crate) struct ResultCollector {
    state: Mutex<CollectorState>,
}

impl ResultCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a result. Returns `false` if sealed or already recorded.
    pub(crate) fn insert(&self, event_type: &str, outcome: TaskOutcome) -> bool {
        let mut state = self.state.lock();
        if state.sealed || state.results.contains_key(event_type) {
            return false;
        }
        state.results.insert(event_type.to_string(), outcome);
        true
    }

    /// Stop accepting results and take everything recorded so far.
    pub(crate) fn seal(&self) -> HashMap<String, TaskOutcome> {
        let mut state = self.state.lock();
        state.sealed = true;
        std::mem::take(&mut state.results)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().results.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventTypeState;
    use std::sync::Arc;
    use std::thread;

    fn resolved(event_type: &str) -> TaskOutcome {
        TaskOutcome::Resolved(SubscriptionEventTypeStats {
            event_type: event_type.to_string(),
            state: EventTypeState::Ok,
            inconsistent: false,
            partitions: Vec::new(),
        })
    }

    #[test]
    fn test_first_result_wins() {
        let collector = ResultCollector::new();
        assert!(collector.insert("orders", resolved("orders")));
        assert!(!collector.insert(
            "orders",
            TaskOutcome::Failed {
                class: FailureClass::Transient,
                reason: "late".into()
            }
        ));
        let results = collector.seal();
        assert_eq!(results.get("orders"), Some(&resolved("orders")));
    }

    #[test]
    fn test_sealed_rejects_inserts() {
        let collector = ResultCollector::new();
        assert!(collector.insert("orders", resolved("orders")));
        let results = collector.seal();
        assert_eq!(results.len(), 1);
        assert!(!collector.insert("payments", resolved("payments")));
        assert!(collector.seal().is_empty());
    }

    #[test]
    fn test_concurrent_inserts() {
        let collector = Arc::new(ResultCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for j in 0..50 {
                        let name = format!("et-{}-{}", i, j);
                        assert!(collector.insert(&name, resolved(&name)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(collector.len(), 400);
    }

    #[test]
    fn test_permanent_detection() {
        let outcome = TaskOutcome::Failed {
            class: FailureClass::Permanent,
            reason: "gone".into(),
        };
        assert!(outcome.is_permanent());
        assert!(!resolved("orders").is_permanent());
    }
}
