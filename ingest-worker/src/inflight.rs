use std::future::Future;

use tokio_util::task::TaskTracker;

use crate::metrics_utils::INFLIGHT_UPSERTS;

/// Keeps count of pending storage writes so shutdown can wait for them to settle.
///
/// Tracking starts when [`InFlightTracker::track`] is called, not when the returned future is
/// first polled, so a write handed to the tracker is always visible to [`InFlightTracker::drain`].
#[derive(Clone, Default)]
pub struct InFlightTracker {
    tracker: TaskTracker,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `operation` and returns a future yielding its unchanged output.
    /// The operation is removed from the tracked set once it settles, whatever the outcome.
    pub fn track<F>(&self, operation: F) -> impl Future<Output = F::Output> + Send
    where
        F: Future + Send,
    {
        let tracked = self.tracker.track_future(operation);
        metrics::gauge!(INFLIGHT_UPSERTS).set(self.tracker.len() as f64);

        let tracker = self.tracker.clone();
        async move {
            let output = tracked.await;
            metrics::gauge!(INFLIGHT_UPSERTS).set(tracker.len() as f64);
            output
        }
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Waits until every tracked operation has settled, including ones registered while
    /// draining.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_output_is_passed_through() {
        let tracker = InFlightTracker::new();

        assert_eq!(tracker.track(async { 7 }).await, 7);
        let failed: Result<(), &str> = tracker.track(async { Err("boom") }).await;
        assert_eq!(failed, Err("boom"));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_successes_and_failures() {
        let tracker = InFlightTracker::new();
        let settled = Arc::new(Mutex::new(Vec::new()));

        for (delay, outcome) in [(50, Ok(())), (100, Ok(())), (150, Err("storage down"))] {
            let settled = settled.clone();
            let operation = tracker.track(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                settled.lock().unwrap().push(outcome);
                outcome
            });
            tokio::spawn(operation);
        }
        assert_eq!(tracker.len(), 3);

        tracker.drain().await;

        let settled = settled.lock().unwrap();
        assert_eq!(settled.len(), 3);
        assert_eq!(settled.iter().filter(|o| o.is_err()).count(), 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_drain_with_nothing_tracked_returns_immediately() {
        let tracker = InFlightTracker::new();
        tokio::time::timeout(Duration::from_secs(1), tracker.drain())
            .await
            .unwrap();
    }
}
