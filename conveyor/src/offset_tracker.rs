//! Offset bookkeeping for at-least-once processing. Per partition we keep the
//! set of consumed offsets and the subset that finished processing; the commit
//! point is the longest consumed prefix that is fully processed. Offsets may
//! complete out of order across subpartitions without ever advancing the
//! watermark past a still-in-flight earlier offset.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::TrackerError;
use crate::types::Partition;

struct PartitionState {
    /// Consumed offsets, each with the instant it was enqueued.
    consumed: BTreeMap<i64, Instant>,
    /// Consumed offsets whose processing finished (success, skip, or
    /// fallback ack). Always a subset of `consumed`.
    processed: BTreeSet<i64>,
    /// Next offset a commit would start replay from; -1 until the first
    /// commit point is derived.
    committed: i64,
    /// Highest offset ever consumed; survives trimming so monotonicity
    /// stays enforceable.
    high_water: i64,
}

impl PartitionState {
    fn new() -> Self {
        Self {
            consumed: BTreeMap::new(),
            processed: BTreeSet::new(),
            committed: -1,
            high_water: -1,
        }
    }
}

pub struct OffsetTracker {
    partitions: RwLock<HashMap<Partition, Arc<Mutex<PartitionState>>>>,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Create tracking state for a newly assigned partition.
    pub fn ensure_partition(&self, partition: &Partition) {
        let mut partitions = self.partitions.write().expect("tracker lock poisoned");
        partitions
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PartitionState::new())));
    }

    /// Drop all state for a revoked partition. Later completions for it are
    /// rejected as untracked.
    pub fn drop_partition(&self, partition: &Partition) {
        let mut partitions = self.partitions.write().expect("tracker lock poisoned");
        partitions.remove(partition);
    }

    pub fn tracked_partitions(&self) -> Vec<Partition> {
        let partitions = self.partitions.read().expect("tracker lock poisoned");
        partitions.keys().cloned().collect()
    }

    fn state_of(&self, partition: &Partition) -> Option<Arc<Mutex<PartitionState>>> {
        let partitions = self.partitions.read().expect("tracker lock poisoned");
        partitions.get(partition).cloned()
    }

    /// Record a polled offset. Offsets must arrive strictly increasing per
    /// partition; anything else means the consumer and broker disagree about
    /// the stream and is fatal upstream.
    pub fn add_consumed(
        &self,
        partition: &Partition,
        offset: i64,
        at: Instant,
    ) -> Result<(), TrackerError> {
        let state = self
            .state_of(partition)
            .ok_or_else(|| TrackerError::UntrackedPartition {
                partition: partition.clone(),
            })?;
        let mut state = state.lock().expect("partition state lock poisoned");
        if offset <= state.high_water {
            return Err(TrackerError::NonMonotonic {
                partition: partition.clone(),
                offset,
                high_water: state.high_water,
            });
        }
        state.consumed.insert(offset, at);
        state.high_water = offset;
        Ok(())
    }

    /// Record a completed offset. Only offsets currently in the consumed set
    /// are accepted, and only once.
    pub fn add_processed(&self, partition: &Partition, offset: i64) -> Result<(), TrackerError> {
        let state = self
            .state_of(partition)
            .ok_or_else(|| TrackerError::UntrackedPartition {
                partition: partition.clone(),
            })?;
        let mut state = state.lock().expect("partition state lock poisoned");
        if !state.consumed.contains_key(&offset) {
            return Err(TrackerError::UnknownOffset {
                partition: partition.clone(),
                offset,
            });
        }
        if !state.processed.insert(offset) {
            return Err(TrackerError::AlreadyProcessed {
                partition: partition.clone(),
                offset,
            });
        }
        Ok(())
    }

    /// Derive the next commit point: walk the processed prefix of the
    /// consumed set, trim it, and return the offset replay would restart
    /// from (last processed + 1). `None` when the head of the partition is
    /// still in flight.
    pub fn next_commit(&self, partition: &Partition) -> Option<i64> {
        let state = self.state_of(partition)?;
        let mut state = state.lock().expect("partition state lock poisoned");
        let mut last = None;
        while let Some(offset) = state.consumed.keys().next().copied() {
            if !state.processed.remove(&offset) {
                break;
            }
            state.consumed.pop_first();
            last = Some(offset);
        }
        let commit = last.map(|offset| offset + 1)?;
        state.committed = commit;
        Some(commit)
    }

    /// Next commit points across every tracked partition, ready for a single
    /// commit call.
    pub fn collect_commits(&self) -> BTreeMap<Partition, i64> {
        let mut commits = BTreeMap::new();
        for partition in self.tracked_partitions() {
            if let Some(offset) = self.next_commit(&partition) {
                commits.insert(partition, offset);
            }
        }
        commits
    }

    /// The committed watermark for a partition, -1 before the first commit.
    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        let state = self.state_of(partition)?;
        let state = state.lock().expect("partition state lock poisoned");
        Some(state.committed)
    }

    /// Age of the oldest consumed-but-unprocessed offset on one partition.
    pub fn oldest_inflight_age(&self, partition: &Partition, now: Instant) -> Option<Duration> {
        let state = self.state_of(partition)?;
        let state = state.lock().expect("partition state lock poisoned");
        state
            .consumed
            .iter()
            .find(|(offset, _)| !state.processed.contains(*offset))
            .map(|(_, at)| now.saturating_duration_since(*at))
    }

    /// The worst in-flight age across partitions, for the watchdog.
    pub fn max_inflight_age(&self, now: Instant) -> Option<(Partition, Duration)> {
        self.tracked_partitions()
            .into_iter()
            .filter_map(|partition| {
                self.oldest_inflight_age(&partition, now)
                    .map(|age| (partition, age))
            })
            .max_by_key(|(_, age)| *age)
    }

    /// Consumed-but-unprocessed count across all partitions.
    pub fn in_flight(&self) -> usize {
        self.tracked_partitions()
            .into_iter()
            .filter_map(|partition| self.state_of(&partition))
            .map(|state| {
                let state = state.lock().expect("partition state lock poisoned");
                state.consumed.len() - state.processed.len()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition::new("events", 0)
    }

    fn tracker_with_partition() -> OffsetTracker {
        let tracker = OffsetTracker::new();
        tracker.ensure_partition(&partition());
        tracker
    }

    #[test]
    fn consumed_must_be_strictly_increasing() {
        let tracker = tracker_with_partition();
        let now = Instant::now();
        tracker.add_consumed(&partition(), 10, now).unwrap();
        tracker.add_consumed(&partition(), 12, now).unwrap();
        let err = tracker.add_consumed(&partition(), 12, now).unwrap_err();
        assert!(matches!(err, TrackerError::NonMonotonic { high_water: 12, .. }));
        let err = tracker.add_consumed(&partition(), 11, now).unwrap_err();
        assert!(matches!(err, TrackerError::NonMonotonic { .. }));
    }

    #[test]
    fn processed_requires_membership_and_uniqueness() {
        let tracker = tracker_with_partition();
        tracker
            .add_consumed(&partition(), 5, Instant::now())
            .unwrap();
        assert!(matches!(
            tracker.add_processed(&partition(), 6),
            Err(TrackerError::UnknownOffset { offset: 6, .. })
        ));
        tracker.add_processed(&partition(), 5).unwrap();
        assert!(matches!(
            tracker.add_processed(&partition(), 5),
            Err(TrackerError::AlreadyProcessed { offset: 5, .. })
        ));
    }

    #[test]
    fn untracked_partition_is_rejected() {
        let tracker = OffsetTracker::new();
        assert!(matches!(
            tracker.add_processed(&partition(), 0),
            Err(TrackerError::UntrackedPartition { .. })
        ));
        assert!(matches!(
            tracker.add_consumed(&partition(), 0, Instant::now()),
            Err(TrackerError::UntrackedPartition { .. })
        ));
    }

    // Two subpartitions of one partition complete out of order: consumed
    // [10, 11, 12, 13], completions land as 11, 13, 10, 12.
    #[test]
    fn commit_point_tracks_the_processed_prefix() {
        let tracker = tracker_with_partition();
        let now = Instant::now();
        for offset in [10, 11, 12, 13] {
            tracker.add_consumed(&partition(), offset, now).unwrap();
        }

        tracker.add_processed(&partition(), 11).unwrap();
        assert_eq!(tracker.next_commit(&partition()), None);

        tracker.add_processed(&partition(), 13).unwrap();
        assert_eq!(tracker.next_commit(&partition()), None);

        tracker.add_processed(&partition(), 10).unwrap();
        assert_eq!(tracker.next_commit(&partition()), Some(12));

        tracker.add_processed(&partition(), 12).unwrap();
        assert_eq!(tracker.next_commit(&partition()), Some(14));
        assert_eq!(tracker.committed(&partition()), Some(14));

        // Nothing left to commit.
        assert_eq!(tracker.next_commit(&partition()), None);
    }

    #[test]
    fn trimmed_offsets_cannot_complete_again() {
        let tracker = tracker_with_partition();
        tracker
            .add_consumed(&partition(), 3, Instant::now())
            .unwrap();
        tracker.add_processed(&partition(), 3).unwrap();
        assert_eq!(tracker.next_commit(&partition()), Some(4));
        assert!(matches!(
            tracker.add_processed(&partition(), 3),
            Err(TrackerError::UnknownOffset { .. })
        ));
    }

    #[test]
    fn committed_starts_negative() {
        let tracker = tracker_with_partition();
        assert_eq!(tracker.committed(&partition()), Some(-1));
        assert_eq!(tracker.next_commit(&partition()), None);
    }

    #[test]
    fn oldest_inflight_age_skips_processed_offsets() {
        let tracker = tracker_with_partition();
        let start = Instant::now();
        tracker.add_consumed(&partition(), 0, start).unwrap();
        tracker
            .add_consumed(&partition(), 1, start + Duration::from_millis(50))
            .unwrap();
        tracker.add_processed(&partition(), 0).unwrap();

        let now = start + Duration::from_millis(200);
        let age = tracker.oldest_inflight_age(&partition(), now).unwrap();
        assert_eq!(age, Duration::from_millis(150));

        tracker.add_processed(&partition(), 1).unwrap();
        assert_eq!(tracker.oldest_inflight_age(&partition(), now), None);
    }

    #[test]
    fn collect_commits_covers_all_partitions() {
        let tracker = OffsetTracker::new();
        let a = Partition::new("events", 0);
        let b = Partition::new("events", 1);
        tracker.ensure_partition(&a);
        tracker.ensure_partition(&b);
        let now = Instant::now();
        tracker.add_consumed(&a, 7, now).unwrap();
        tracker.add_consumed(&b, 2, now).unwrap();
        tracker.add_processed(&a, 7).unwrap();

        let commits = tracker.collect_commits();
        assert_eq!(commits.get(&a), Some(&8));
        assert!(!commits.contains_key(&b));
    }

    #[test]
    fn drop_partition_forgets_everything() {
        let tracker = tracker_with_partition();
        tracker
            .add_consumed(&partition(), 1, Instant::now())
            .unwrap();
        tracker.drop_partition(&partition());
        assert!(tracker.tracked_partitions().is_empty());
        assert!(matches!(
            tracker.add_processed(&partition(), 1),
            Err(TrackerError::UntrackedPartition { .. })
        ));
    }

    #[test]
    fn in_flight_counts_unprocessed_only() {
        let tracker = tracker_with_partition();
        let now = Instant::now();
        for offset in 0..4 {
            tracker.add_consumed(&partition(), offset, now).unwrap();
        }
        tracker.add_processed(&partition(), 1).unwrap();
        assert_eq!(tracker.in_flight(), 3);
    }
}
