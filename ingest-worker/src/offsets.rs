//! Commit watermarks for messages that settle out of order.
//!
//! Messages from one partition are processed concurrently, so they can finish in any order. The
//! offset stored for commit is the lowest offset still being processed (or one past the highest
//! settled offset when nothing is pending), so a commit never skips over an unsettled message and
//! the stored offset never moves backwards.
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
struct PartitionOffsets {
    unsettled: BTreeSet<i64>,
    highest_settled: Option<i64>,
    stored: Option<i64>,
}

impl PartitionOffsets {
    fn watermark(&self) -> Option<i64> {
        match self.unsettled.first() {
            Some(&lowest) => Some(lowest),
            None => self.highest_settled.map(|offset| offset + 1),
        }
    }
}

#[derive(Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionOffsets>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a message handed out for processing.
    pub fn delivered(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry((topic.to_owned(), partition))
            .or_default()
            .unsettled
            .insert(offset);
    }

    /// Marks `offset` as settled and calls `store` with the new watermark if it moved forward.
    ///
    /// `store` runs under the tracker lock so concurrent settlements store watermarks in order.
    /// Returns the stored watermark, or `None` when an earlier offset is still unsettled.
    pub fn settle<F, E>(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        store: F,
    ) -> Result<Option<i64>, E>
    where
        F: FnOnce(i64) -> Result<(), E>,
    {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let state = partitions
            .entry((topic.to_owned(), partition))
            .or_default();

        state.unsettled.remove(&offset);
        state.highest_settled = Some(state.highest_settled.map_or(offset, |h| h.max(offset)));

        let Some(watermark) = state.watermark() else {
            return Ok(None);
        };
        if state.stored.is_some_and(|stored| watermark <= stored) {
            return Ok(None);
        }

        store(watermark)?;
        state.stored = Some(watermark);
        Ok(Some(watermark))
    }

    /// Number of delivered messages not yet settled, across all partitions.
    pub fn unsettled(&self) -> usize {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|state| state.unsettled.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::convert::Infallible;

    fn settle(tracker: &OffsetTracker, stored: &RefCell<Vec<i64>>, offset: i64) -> Option<i64> {
        tracker
            .settle("raw", 0, offset, |next| {
                stored.borrow_mut().push(next);
                Ok::<_, Infallible>(())
            })
            .unwrap()
    }

    #[test]
    fn test_later_message_does_not_commit_past_unsettled_one() {
        let tracker = OffsetTracker::new();
        let stored = RefCell::new(Vec::new());
        for offset in 10..=12 {
            tracker.delivered("raw", 0, offset);
        }

        // 11 and 12 finish while 10 is still retrying.
        assert_eq!(settle(&tracker, &stored, 12), Some(10));
        assert_eq!(settle(&tracker, &stored, 11), None);
        assert!(stored.borrow().iter().all(|&next| next <= 10));

        assert_eq!(settle(&tracker, &stored, 10), Some(13));
        assert_eq!(*stored.borrow(), vec![10, 13]);
        assert_eq!(tracker.unsettled(), 0);
    }

    #[test]
    fn test_stored_offsets_never_move_backwards() {
        let tracker = OffsetTracker::new();
        let stored = RefCell::new(Vec::new());
        for offset in 0..6 {
            tracker.delivered("raw", 0, offset);
        }

        for offset in [3, 0, 5, 1, 4, 2] {
            settle(&tracker, &stored, offset);
        }

        let stored = stored.into_inner();
        assert!(stored.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(stored.last(), Some(&6));
    }

    #[test]
    fn test_in_order_settlement_stores_every_offset() {
        let tracker = OffsetTracker::new();
        let stored = RefCell::new(Vec::new());

        for offset in 0..3 {
            tracker.delivered("raw", 0, offset);
            assert_eq!(settle(&tracker, &stored, offset), Some(offset + 1));
        }
    }

    #[test]
    fn test_failed_store_is_retried_on_next_settlement() {
        let tracker = OffsetTracker::new();
        tracker.delivered("raw", 0, 0);
        tracker.delivered("raw", 0, 1);

        let failed = tracker.settle("raw", 0, 0, |_| Err("broker gone"));
        assert_eq!(failed, Err("broker gone"));

        let retried = tracker.settle("raw", 0, 1, |next| {
            assert_eq!(next, 2);
            Ok::<_, &str>(())
        });
        assert_eq!(retried, Ok(Some(2)));
    }

    #[test]
    fn test_partitions_are_tracked_independently() {
        let tracker = OffsetTracker::new();
        tracker.delivered("raw", 0, 5);
        tracker.delivered("raw", 1, 5);
        tracker.delivered("domain", 0, 5);
        tracker.delivered("raw", 0, 6);

        let stored = tracker.settle("raw", 1, 5, |_| Ok::<_, Infallible>(()));
        assert_eq!(stored, Ok(Some(6)));

        let stored = tracker.settle("raw", 0, 6, |_| Ok::<_, Infallible>(()));
        assert_eq!(stored, Ok(Some(5)));
        assert_eq!(tracker.unsettled(), 2);
    }
}
