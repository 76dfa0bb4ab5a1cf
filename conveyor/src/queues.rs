//! Per-subpartition FIFO queues with byte budgets. One producer (the consumer
//! loop) pushes, N workers pick. Picking leases the head record: the queue
//! stays busy and its bytes stay charged until the worker releases, which is
//! what keeps at most one worker per subpartition and makes the pause/resume
//! thresholds see in-process records.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::gauge;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::metric_consts::{QUEUED_RECORDS, QUEUE_BYTES};
use crate::task::TaskSet;
use crate::types::{Partition, Record, Subpartition};

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    /// Per-subpartition byte cap.
    pub max_queue_bytes: u64,
    /// Global byte cap across all queues; `None` means unlimited.
    pub max_total_bytes: Option<u64>,
}

struct SubpartitionQueue {
    records: VecDeque<Record>,
    bytes: u64,
    /// A worker holds the head record of this queue.
    busy: bool,
}

impl SubpartitionQueue {
    fn new() -> Self {
        Self {
            records: VecDeque::new(),
            bytes: 0,
            busy: false,
        }
    }
}

struct State {
    queues: BTreeMap<Subpartition, SubpartitionQueue>,
    total_bytes: u64,
    total_records: usize,
    /// Last picked subpartition; the scan resumes just after it, so every
    /// runnable subpartition is visited within one full rotation.
    cursor: Option<Subpartition>,
}

pub struct QueueManager {
    state: Mutex<State>,
    work_available: Notify,
    limits: QueueLimits,
}

impl QueueManager {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            state: Mutex::new(State {
                queues: BTreeMap::new(),
                total_bytes: 0,
                total_records: 0,
                cursor: None,
            }),
            work_available: Notify::new(),
            limits,
        }
    }

    /// Append a record to its subpartition queue and wake a waiting worker.
    pub fn push(&self, subpartition: Subpartition, record: Record) {
        {
            let mut state = self.state.lock().expect("queue state lock poisoned");
            let size = record.serialized_size;
            let queue = state
                .queues
                .entry(subpartition)
                .or_insert_with(SubpartitionQueue::new);
            queue.records.push_back(record);
            queue.bytes += size;
            state.total_bytes += size;
            state.total_records += 1;
            gauge!(QUEUE_BYTES).set(state.total_bytes as f64);
            gauge!(QUEUED_RECORDS).set(state.total_records as f64);
        }
        self.work_available.notify_one();
    }

    /// Lease the head record of some runnable subpartition: non-empty, not
    /// already driven by a worker, and accepted by its task. Blocks up to
    /// `max_wait`, or until `stop` fires, when nothing is runnable.
    pub async fn pick_runnable(
        &self,
        tasks: &TaskSet,
        max_wait: Duration,
        stop: &CancellationToken,
    ) -> Option<(Subpartition, Record)> {
        let deadline = Instant::now() + max_wait;
        loop {
            // Register interest before scanning so a push that lands between
            // the scan and the await still wakes us.
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(pick) = self.try_pick(tasks) {
                return Some(pick);
            }

            let now = Instant::now();
            if now >= deadline || stop.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(deadline - now) => return None,
                _ = stop.cancelled() => return None,
            }
        }
    }

    fn try_pick(&self, tasks: &TaskSet) -> Option<(Subpartition, Record)> {
        let mut state = self.state.lock().expect("queue state lock poisoned");
        let rotation: Vec<Subpartition> = match state.cursor.clone() {
            Some(cursor) => state
                .queues
                .range((Bound::Excluded(cursor.clone()), Bound::Unbounded))
                .map(|(sub, _)| sub.clone())
                .chain(
                    state
                        .queues
                        .range((Bound::Unbounded, Bound::Included(cursor)))
                        .map(|(sub, _)| sub.clone()),
                )
                .collect(),
            None => state.queues.keys().cloned().collect(),
        };

        for subpartition in rotation {
            let runnable = state
                .queues
                .get(&subpartition)
                .map(|queue| !queue.busy && !queue.records.is_empty())
                .unwrap_or(false);
            if !runnable || !tasks.accepts(&subpartition) {
                continue;
            }
            let queue = state
                .queues
                .get_mut(&subpartition)
                .expect("queue vanished under lock");
            let record = queue
                .records
                .pop_front()
                .expect("non-empty queue had no head");
            queue.busy = true;
            state.total_records -= 1;
            state.cursor = Some(subpartition.clone());
            gauge!(QUEUED_RECORDS).set(state.total_records as f64);
            return Some((subpartition, record));
        }
        None
    }

    /// Return a lease: the worker finished driving the record, so its bytes
    /// come off the budget and the subpartition becomes runnable again.
    pub fn release(&self, subpartition: &Subpartition, bytes: u64) {
        let more_work = {
            let mut state = self.state.lock().expect("queue state lock poisoned");
            let Some(queue) = state.queues.get_mut(subpartition) else {
                // Partition revoked while the record was in process; its
                // bytes already left the budget with the dropped queue.
                return;
            };
            queue.busy = false;
            queue.bytes = queue.bytes.saturating_sub(bytes);
            let remaining = !queue.records.is_empty();
            state.total_bytes = state.total_bytes.saturating_sub(bytes);
            gauge!(QUEUE_BYTES).set(state.total_bytes as f64);
            remaining
        };
        if more_work {
            self.work_available.notify_one();
        }
    }

    /// Whether the consumer should pause polling of this partition: any of
    /// its subpartitions at or over the per-queue cap, or the global cap
    /// reached.
    pub fn should_pause(&self, partition: &Partition) -> bool {
        let state = self.state.lock().expect("queue state lock poisoned");
        if let Some(max_total) = self.limits.max_total_bytes {
            if state.total_bytes >= max_total {
                return true;
            }
        }
        state
            .queues
            .iter()
            .filter(|(sub, _)| sub.partition == *partition)
            .any(|(_, queue)| queue.bytes >= self.limits.max_queue_bytes)
    }

    /// Whether a paused partition may resume: every one of its subpartitions
    /// strictly below the per-queue cap and the global cap no longer reached.
    /// Asymmetric with `should_pause` on purpose, to keep the consumer from
    /// flapping at the boundary.
    pub fn should_resume(&self, partition: &Partition) -> bool {
        let state = self.state.lock().expect("queue state lock poisoned");
        if let Some(max_total) = self.limits.max_total_bytes {
            if state.total_bytes >= max_total {
                return false;
            }
        }
        state
            .queues
            .iter()
            .filter(|(sub, _)| sub.partition == *partition)
            .all(|(_, queue)| queue.bytes < self.limits.max_queue_bytes)
    }

    /// Drop every queue of a revoked partition. Records leased to workers
    /// stay with them; their release becomes a no-op.
    pub fn drop_partition(&self, partition: &Partition) -> usize {
        let mut state = self.state.lock().expect("queue state lock poisoned");
        let keys: Vec<Subpartition> = state
            .queues
            .keys()
            .filter(|sub| sub.partition == *partition)
            .cloned()
            .collect();
        let mut dropped = 0;
        for key in keys {
            if let Some(queue) = state.queues.remove(&key) {
                dropped += queue.records.len();
                state.total_bytes = state.total_bytes.saturating_sub(queue.bytes);
                state.total_records -= queue.records.len();
            }
        }
        gauge!(QUEUE_BYTES).set(state.total_bytes as f64);
        gauge!(QUEUED_RECORDS).set(state.total_records as f64);
        dropped
    }

    pub fn total_bytes(&self) -> u64 {
        self.state
            .lock()
            .expect("queue state lock poisoned")
            .total_bytes
    }

    pub fn queued_records(&self) -> usize {
        self.state
            .lock()
            .expect("queue state lock poisoned")
            .total_records
    }

    pub fn partition_bytes(&self, partition: &Partition) -> u64 {
        let state = self.state.lock().expect("queue state lock poisoned");
        state
            .queues
            .iter()
            .filter(|(sub, _)| sub.partition == *partition)
            .map(|(_, queue)| queue.bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::message::AckableRecord;
    use crate::task::{Task, TaskFactory, TaskOptions};

    struct IdleTask {
        accepting: bool,
    }

    #[async_trait]
    impl Task for IdleTask {
        fn accept(&self, _subpartition: &Subpartition) -> bool {
            self.accepting
        }

        async fn process(&self, _message: AckableRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct IdleFactory {
        accepting: bool,
    }

    impl TaskFactory for IdleFactory {
        fn create(
            &self,
            _subpartition: &Subpartition,
            _options: &TaskOptions,
        ) -> anyhow::Result<Arc<dyn Task>> {
            Ok(Arc::new(IdleTask {
                accepting: self.accepting,
            }))
        }
    }

    fn task_set(accepting: bool) -> TaskSet {
        TaskSet::new(Arc::new(IdleFactory { accepting }), TaskOptions::new())
    }

    fn sub(partition: i32, sub_id: u32) -> Subpartition {
        Subpartition::new(Partition::new("events", partition), sub_id)
    }

    fn record(partition: i32, offset: i64, size: usize) -> Record {
        Record::new(
            Partition::new("events", partition),
            offset,
            None,
            Some(vec![0; size]),
            Vec::new(),
        )
    }

    fn manager(max_queue: u64, max_total: Option<u64>) -> QueueManager {
        QueueManager::new(QueueLimits {
            max_queue_bytes: max_queue,
            max_total_bytes: max_total,
        })
    }

    #[tokio::test]
    async fn pick_returns_fifo_head_and_leases_the_queue() {
        let queues = manager(1024, None);
        let tasks = task_set(true);
        tasks.ensure(&sub(0, 0)).unwrap();
        queues.push(sub(0, 0), record(0, 1, 10));
        queues.push(sub(0, 0), record(0, 2, 10));

        let stop = CancellationToken::new();
        let (picked, head) = queues
            .pick_runnable(&tasks, Duration::from_millis(10), &stop)
            .await
            .unwrap();
        assert_eq!(picked, sub(0, 0));
        assert_eq!(head.offset, 1);

        // Leased queue is not runnable until released.
        assert!(queues
            .pick_runnable(&tasks, Duration::from_millis(10), &stop)
            .await
            .is_none());

        queues.release(&picked, head.serialized_size);
        let (_, next) = queues
            .pick_runnable(&tasks, Duration::from_millis(10), &stop)
            .await
            .unwrap();
        assert_eq!(next.offset, 2);
    }

    #[tokio::test]
    async fn rotation_visits_every_runnable_subpartition() {
        let queues = manager(1024, None);
        let tasks = task_set(true);
        for sub_id in 0..3 {
            tasks.ensure(&sub(0, sub_id)).unwrap();
            queues.push(sub(0, sub_id), record(0, sub_id as i64, 10));
        }

        let stop = CancellationToken::new();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (picked, head) = queues
                .pick_runnable(&tasks, Duration::from_millis(10), &stop)
                .await
                .unwrap();
            seen.push(picked.sub_id);
            queues.release(&picked, head.serialized_size);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn non_accepting_tasks_are_skipped() {
        let queues = manager(1024, None);
        let tasks = task_set(false);
        tasks.ensure(&sub(0, 0)).unwrap();
        queues.push(sub(0, 0), record(0, 1, 10));

        let stop = CancellationToken::new();
        assert!(queues
            .pick_runnable(&tasks, Duration::from_millis(10), &stop)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn pick_wakes_up_on_push() {
        let queues = Arc::new(manager(1024, None));
        let tasks = Arc::new(task_set(true));
        tasks.ensure(&sub(0, 0)).unwrap();

        let waiter = {
            let queues = queues.clone();
            let tasks = tasks.clone();
            tokio::spawn(async move {
                let stop = CancellationToken::new();
                queues
                    .pick_runnable(&tasks, Duration::from_secs(5), &stop)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queues.push(sub(0, 0), record(0, 1, 10));

        let picked = waiter.await.unwrap();
        assert_eq!(picked.unwrap().1.offset, 1);
    }

    #[test]
    fn pause_threshold_tracks_byte_totals() {
        let partition = Partition::new("events", 0);
        let queues = manager(1024, None);
        for offset in 0..3 {
            queues.push(sub(0, 0), record(0, offset, 400));
        }
        // 1200 bytes >= 1024: pause.
        assert!(queues.should_pause(&partition));
        assert!(!queues.should_resume(&partition));
        assert_eq!(queues.partition_bytes(&partition), 1200);
    }

    #[tokio::test]
    async fn resume_requires_full_relief() {
        let partition = Partition::new("events", 0);
        let queues = manager(1024, None);
        let tasks = task_set(true);
        tasks.ensure(&sub(0, 0)).unwrap();
        for offset in 0..3 {
            queues.push(sub(0, 0), record(0, offset, 400));
        }
        assert!(queues.should_pause(&partition));

        let stop = CancellationToken::new();
        // Drain one record: 800 bytes left, below the cap only after release.
        let (picked, head) = queues
            .pick_runnable(&tasks, Duration::from_millis(10), &stop)
            .await
            .unwrap();
        assert!(queues.should_pause(&partition));
        queues.release(&picked, head.serialized_size);
        assert!(!queues.should_pause(&partition));
        assert!(queues.should_resume(&partition));

        // Drain to 400 bytes, the scenario end state.
        let (picked, head) = queues
            .pick_runnable(&tasks, Duration::from_millis(10), &stop)
            .await
            .unwrap();
        queues.release(&picked, head.serialized_size);
        assert_eq!(queues.total_bytes(), 400);
        assert!(queues.should_resume(&partition));
    }

    #[test]
    fn global_cap_pauses_every_partition_and_blocks_resume() {
        let queues = manager(10_000, Some(500));
        queues.push(sub(0, 0), record(0, 0, 300));
        queues.push(sub(1, 0), record(1, 0, 300));

        let p0 = Partition::new("events", 0);
        let p1 = Partition::new("events", 1);
        assert!(queues.should_pause(&p0));
        assert!(queues.should_pause(&p1));
        assert!(!queues.should_resume(&p0));
    }

    #[test]
    fn partition_without_queues_may_resume() {
        let queues = manager(1024, None);
        assert!(queues.should_resume(&Partition::new("events", 0)));
        assert!(!queues.should_pause(&Partition::new("events", 0)));
    }

    #[tokio::test]
    async fn drop_partition_empties_queues_and_ignores_late_release() {
        let partition = Partition::new("events", 0);
        let queues = manager(1024, None);
        let tasks = task_set(true);
        tasks.ensure(&sub(0, 0)).unwrap();
        tasks.ensure(&sub(0, 1)).unwrap();
        for offset in 0..3 {
            queues.push(sub(0, 0), record(0, offset, 100));
        }
        queues.push(sub(0, 1), record(0, 3, 100));

        let stop = CancellationToken::new();
        let (picked, head) = queues
            .pick_runnable(&tasks, Duration::from_millis(10), &stop)
            .await
            .unwrap();

        let dropped = queues.drop_partition(&partition);
        assert_eq!(dropped, 3);
        assert_eq!(queues.total_bytes(), 0);
        assert_eq!(queues.queued_records(), 0);

        // The worker still holds the leased record; releasing after the drop
        // must not corrupt the counters.
        queues.release(&picked, head.serialized_size);
        assert_eq!(queues.total_bytes(), 0);
    }
}
