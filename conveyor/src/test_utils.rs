//! Hermetic doubles for the pipeline: a scripted in-memory log client, tasks
//! that record or park what they see, and a counting failure sink. Shared by
//! the unit modules and the integration tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::config::{Config, FailureAction, KafkaConfig};
use crate::error::{ClientError, CommitError};
use crate::log_client::{LogClient, PolledBatch};
use crate::message::AckableRecord;
use crate::sink::FailureSink;
use crate::task::{Task, TaskFactory, TaskOptions};
use crate::types::{Partition, Record, Subpartition};

/// A config with timings tightened for tests; tests mutate what they need.
pub fn test_config() -> Config {
    Config {
        topics: "events".to_string(),
        poll_timeout_ms: 20,
        commit_interval_ms: 25,
        processing_timeout_ms: 300_000,
        commit_retries: 3,
        worker_threads_num: 2,
        worker_sleep_ms: 20,
        queue_max_size_bytes: 256 * 1024 * 1024,
        queue_total_max_size_bytes: None,
        failure_action: FailureAction::Shutdown,
        fallback_topic: None,
        shutdown_grace_ms: 2_000,
        kafka: KafkaConfig::default(),
    }
}

pub fn test_record(partition: &Partition, offset: i64, size: usize) -> Record {
    Record::new(
        partition.clone(),
        offset,
        Some(offset.to_be_bytes().to_vec()),
        Some(vec![0; size]),
        Vec::new(),
    )
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}

#[derive(Default)]
struct ScriptState {
    assigned_events: VecDeque<Vec<Partition>>,
    revoked_events: VecDeque<Vec<Partition>>,
    pending: BTreeMap<Partition, VecDeque<Record>>,
    paused: HashSet<Partition>,
    commits: Vec<BTreeMap<Partition, i64>>,
    commit_errors: VecDeque<CommitError>,
    pause_calls: Vec<Vec<Partition>>,
    resume_calls: Vec<Vec<Partition>>,
    closed: bool,
}

/// In-memory log client driven live by the test: assignments, revocations,
/// and records are scripted through the handle, commits and pause/resume
/// calls are recorded for assertions. Paused partitions hold their records,
/// matching broker behavior.
#[derive(Default)]
pub struct ScriptedLogClient {
    state: Mutex<ScriptState>,
}

impl ScriptedLogClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_assign(&self, partitions: Vec<Partition>) {
        self.state
            .lock()
            .unwrap()
            .assigned_events
            .push_back(partitions);
    }

    /// Revoke partitions; anything still pending for them is withheld, as
    /// the broker would hand it to the next owner.
    pub fn script_revoke(&self, partitions: Vec<Partition>) {
        let mut state = self.state.lock().unwrap();
        for partition in &partitions {
            state.pending.remove(partition);
        }
        state.revoked_events.push_back(partitions);
    }

    pub fn script_records(&self, records: Vec<Record>) {
        let mut state = self.state.lock().unwrap();
        for record in records {
            state
                .pending
                .entry(record.partition.clone())
                .or_default()
                .push_back(record);
        }
    }

    pub fn fail_next_commits(&self, errors: Vec<CommitError>) {
        self.state.lock().unwrap().commit_errors.extend(errors);
    }

    pub fn commits(&self) -> Vec<BTreeMap<Partition, i64>> {
        self.state.lock().unwrap().commits.clone()
    }

    /// The latest committed next-offset for a partition, if any commit
    /// included it.
    pub fn committed_for(&self, partition: &Partition) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .commits
            .iter()
            .rev()
            .find_map(|commit| commit.get(partition).copied())
    }

    pub fn pause_calls(&self) -> Vec<Vec<Partition>> {
        self.state.lock().unwrap().pause_calls.clone()
    }

    pub fn resume_calls(&self) -> Vec<Vec<Partition>> {
        self.state.lock().unwrap().resume_calls.clone()
    }

    pub fn was_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl LogClient for ScriptedLogClient {
    async fn poll(&self, timeout: Duration) -> Result<PolledBatch, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let mut batch = PolledBatch::default();
                while let Some(partitions) = state.assigned_events.pop_front() {
                    batch.assigned.extend(partitions);
                }
                while let Some(partitions) = state.revoked_events.pop_front() {
                    batch.revoked.extend(partitions);
                }
                let paused = state.paused.clone();
                for (partition, queue) in state.pending.iter_mut() {
                    if paused.contains(partition) {
                        continue;
                    }
                    while let Some(record) = queue.pop_front() {
                        batch.records.push(record);
                    }
                }
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            if Instant::now() >= deadline {
                return Ok(PolledBatch::default());
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.paused.extend(partitions.iter().cloned());
        state.pause_calls.push(partitions.to_vec());
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        for partition in partitions {
            state.paused.remove(partition);
        }
        state.resume_calls.push(partitions.to_vec());
        Ok(())
    }

    async fn commit(&self, offsets: &BTreeMap<Partition, i64>) -> Result<(), CommitError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.commit_errors.pop_front() {
            return Err(err);
        }
        state.commits.push(offsets.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Task that acks records as they arrive and records the order it saw them
/// in, with optional scripted failures and blocks per offset.
pub struct RecordingTask {
    subpartition: Subpartition,
    processed: Arc<Mutex<Vec<(Subpartition, i64)>>>,
    closed: Arc<Mutex<Vec<Subpartition>>>,
    fail_offsets: Arc<HashSet<i64>>,
    block_offsets: Arc<HashSet<i64>>,
    delay: Option<Duration>,
}

#[async_trait]
impl Task for RecordingTask {
    async fn process(&self, message: AckableRecord) -> anyhow::Result<()> {
        if self.block_offsets.contains(&message.offset()) {
            // Park well past any watchdog; the supervisor aborts us.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_offsets.contains(&message.offset()) {
            message.nack(anyhow!("scripted failure")).await;
            return Ok(());
        }
        self.processed
            .lock()
            .unwrap()
            .push((message.subpartition().clone(), message.offset()));
        message.ack().await;
        Ok(())
    }

    async fn close(&self) {
        self.closed.lock().unwrap().push(self.subpartition.clone());
    }
}

#[derive(Default)]
pub struct RecordingTaskFactory {
    pub processed: Arc<Mutex<Vec<(Subpartition, i64)>>>,
    pub closed: Arc<Mutex<Vec<Subpartition>>>,
    pub fail_offsets: Arc<HashSet<i64>>,
    pub block_offsets: Arc<HashSet<i64>>,
    pub delay: Option<Duration>,
}

impl RecordingTaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(offsets: impl IntoIterator<Item = i64>) -> Self {
        Self {
            fail_offsets: Arc::new(offsets.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn blocking(offsets: impl IntoIterator<Item = i64>) -> Self {
        Self {
            block_offsets: Arc::new(offsets.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn processed_offsets(&self) -> Vec<(Subpartition, i64)> {
        self.processed.lock().unwrap().clone()
    }

    pub fn closed_subpartitions(&self) -> Vec<Subpartition> {
        self.closed.lock().unwrap().clone()
    }
}

impl TaskFactory for RecordingTaskFactory {
    fn create(
        &self,
        subpartition: &Subpartition,
        _options: &TaskOptions,
    ) -> anyhow::Result<Arc<dyn Task>> {
        Ok(Arc::new(RecordingTask {
            subpartition: subpartition.clone(),
            processed: self.processed.clone(),
            closed: self.closed.clone(),
            fail_offsets: self.fail_offsets.clone(),
            block_offsets: self.block_offsets.clone(),
            delay: self.delay,
        }))
    }
}

/// Task that never completes records itself: it parks the completion handle
/// for the test to ack or nack in whatever order it wants.
pub struct ParkingTask {
    subpartition: Subpartition,
    parked: Arc<Mutex<HashMap<i64, AckableRecord>>>,
    closed: Arc<Mutex<Vec<Subpartition>>>,
}

#[async_trait]
impl Task for ParkingTask {
    async fn process(&self, message: AckableRecord) -> anyhow::Result<()> {
        self.parked
            .lock()
            .unwrap()
            .insert(message.offset(), message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.lock().unwrap().push(self.subpartition.clone());
    }
}

#[derive(Default)]
pub struct ParkingTaskFactory {
    pub parked: Arc<Mutex<HashMap<i64, AckableRecord>>>,
    pub closed: Arc<Mutex<Vec<Subpartition>>>,
}

impl ParkingTaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    pub fn take(&self, offset: i64) -> Option<AckableRecord> {
        self.parked.lock().unwrap().remove(&offset)
    }

    pub fn closed_subpartitions(&self) -> Vec<Subpartition> {
        self.closed.lock().unwrap().clone()
    }
}

impl TaskFactory for ParkingTaskFactory {
    fn create(
        &self,
        subpartition: &Subpartition,
        _options: &TaskOptions,
    ) -> anyhow::Result<Arc<dyn Task>> {
        Ok(Arc::new(ParkingTask {
            subpartition: subpartition.clone(),
            parked: self.parked.clone(),
            closed: self.closed.clone(),
        }))
    }
}

/// Failure sink that records deliveries, optionally refusing them all.
pub struct CountingSink {
    delivered: Mutex<Vec<(Partition, i64)>>,
    fail: bool,
    closed: Mutex<bool>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            fail: false,
            closed: Mutex::new(false),
        }
    }

    pub fn failing() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            fail: true,
            closed: Mutex::new(false),
        }
    }

    pub fn delivered(&self) -> Vec<(Partition, i64)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl Default for CountingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FailureSink for CountingSink {
    async fn deliver(&self, record: &Record, _cause: &anyhow::Error) -> anyhow::Result<()> {
        if self.fail {
            return Err(anyhow!("sink unavailable"));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((record.partition.clone(), record.offset));
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}
