//! The single consumer loop. Each cycle polls the log client, folds
//! rebalance events into the shared state, routes records to subpartition
//! queues, reconciles pause/resume against the byte budgets, runs the
//! processing watchdog, and commits on the configured cadence. Centralizing
//! tracker reads and commits here means every commit captures a consistent
//! snapshot.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use tracing::{debug, error, info, warn};

use crate::activity::Activity;
use crate::config::Config;
use crate::error::{CommitError, FatalError};
use crate::log_client::LogClient;
use crate::metric_consts::{
    COMMIT_FAILURES, COMMIT_RETRIES, OFFSETS_COMMITTED, OLDEST_INFLIGHT_AGE_MS,
    PARTITIONS_ASSIGNED, PARTITIONS_PAUSED, PARTITIONS_RESUMED, PARTITIONS_REVOKED,
    POLL_BATCH_SIZE, RECORDS_DROPPED_ON_REVOKE, RECORDS_RECEIVED,
};
use crate::offset_tracker::OffsetTracker;
use crate::queues::QueueManager;
use crate::task::{Partitioner, TaskSet};
use crate::types::{Partition, Record, Subpartition};

const COMMIT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

pub(crate) struct ConsumerLoop {
    client: Arc<dyn LogClient>,
    queues: Arc<QueueManager>,
    tracker: Arc<OffsetTracker>,
    tasks: Arc<TaskSet>,
    partitioner: Arc<dyn Partitioner>,
    poll_timeout: Duration,
    commit_interval: Duration,
    processing_timeout: Duration,
    commit_retries: u32,
    assigned: HashSet<Partition>,
    paused: HashSet<Partition>,
    last_commit: Instant,
}

impl ConsumerLoop {
    pub(crate) fn new(
        client: Arc<dyn LogClient>,
        queues: Arc<QueueManager>,
        tracker: Arc<OffsetTracker>,
        tasks: Arc<TaskSet>,
        partitioner: Arc<dyn Partitioner>,
        config: &Config,
    ) -> Self {
        Self {
            client,
            queues,
            tracker,
            tasks,
            partitioner,
            poll_timeout: config.poll_timeout(),
            commit_interval: config.commit_interval(),
            processing_timeout: config.processing_timeout(),
            commit_retries: config.commit_retries,
            assigned: HashSet::new(),
            paused: HashSet::new(),
            last_commit: Instant::now(),
        }
    }

    fn handle_assigned(&mut self, partitions: &[Partition]) {
        for partition in partitions {
            if self.assigned.insert(partition.clone()) {
                self.tracker.ensure_partition(partition);
                counter!(PARTITIONS_ASSIGNED).increment(1);
                info!(partition = %partition, "partition assigned");
            }
        }
    }

    /// Commit what is committable for the revoked partitions, then drop
    /// their queues, tracker state, and tasks. The commit is best-effort:
    /// after a rebalance the new owner replays from the last commit either
    /// way.
    async fn handle_revoked(&mut self, partitions: &[Partition]) {
        let mut commits = BTreeMap::new();
        for partition in partitions {
            if self.assigned.contains(partition) {
                if let Some(offset) = self.tracker.next_commit(partition) {
                    commits.insert(partition.clone(), offset);
                }
            }
        }
        if !commits.is_empty() {
            match self.client.commit(&commits).await {
                Ok(()) => counter!(OFFSETS_COMMITTED).increment(commits.len() as u64),
                Err(err) => warn!(error = %err, "commit during revocation failed"),
            }
        }

        for partition in partitions {
            if !self.assigned.remove(partition) {
                continue;
            }
            let dropped = self.queues.drop_partition(partition);
            if dropped > 0 {
                counter!(RECORDS_DROPPED_ON_REVOKE).increment(dropped as u64);
            }
            self.tracker.drop_partition(partition);
            self.tasks.close_partition(partition).await;
            self.paused.remove(partition);
            counter!(PARTITIONS_REVOKED).increment(1);
            info!(partition = %partition, dropped, "partition revoked");
        }
    }

    fn route(&mut self, record: Record) -> Result<(), FatalError> {
        let partition = record.partition.clone();
        if self.assigned.insert(partition.clone()) {
            // Records can arrive in the same batch as their assignment.
            self.tracker.ensure_partition(&partition);
        }
        self.tracker
            .add_consumed(&partition, record.offset, record.received_at)
            .map_err(|err| FatalError::InvariantViolation(err.to_string()))?;

        let sub_id = self.partitioner.subpartition_for(&record);
        let subpartition = Subpartition::new(partition, sub_id);
        self.tasks
            .ensure(&subpartition)
            .map_err(|cause| FatalError::TaskInit {
                subpartition: subpartition.clone(),
                cause,
            })?;
        counter!(RECORDS_RECEIVED).increment(1);
        self.queues.push(subpartition, record);
        Ok(())
    }

    fn reconcile_backpressure(&mut self) -> Result<(), FatalError> {
        let mut to_pause = Vec::new();
        let mut to_resume = Vec::new();
        for partition in &self.assigned {
            if self.paused.contains(partition) {
                if self.queues.should_resume(partition) {
                    to_resume.push(partition.clone());
                }
            } else if self.queues.should_pause(partition) {
                to_pause.push(partition.clone());
            }
        }

        if !to_pause.is_empty() {
            self.client.pause(&to_pause).map_err(FatalError::Client)?;
            for partition in to_pause {
                counter!(PARTITIONS_PAUSED).increment(1);
                info!(
                    partition = %partition,
                    buffered_bytes = self.queues.partition_bytes(&partition),
                    "partition paused"
                );
                self.paused.insert(partition);
            }
        }
        if !to_resume.is_empty() {
            self.client.resume(&to_resume).map_err(FatalError::Client)?;
            for partition in to_resume {
                counter!(PARTITIONS_RESUMED).increment(1);
                info!(partition = %partition, "partition resumed");
                self.paused.remove(&partition);
            }
        }
        Ok(())
    }

    fn check_watchdog(&self) -> Result<(), FatalError> {
        match self.tracker.max_inflight_age(Instant::now()) {
            Some((partition, age)) => {
                gauge!(OLDEST_INFLIGHT_AGE_MS).set(age.as_millis() as f64);
                if age >= self.processing_timeout {
                    return Err(FatalError::ProcessingTimeout {
                        partition,
                        age_ms: age.as_millis() as u64,
                        timeout_ms: self.processing_timeout.as_millis() as u64,
                    });
                }
            }
            None => gauge!(OLDEST_INFLIGHT_AGE_MS).set(0.0),
        }
        Ok(())
    }

    async fn maybe_commit(&mut self) -> Result<(), FatalError> {
        if self.last_commit.elapsed() < self.commit_interval {
            return Ok(());
        }
        self.last_commit = Instant::now();
        let commits = self.tracker.collect_commits();
        if commits.is_empty() {
            return Ok(());
        }
        self.commit_with_retry(&commits).await
    }

    async fn commit_with_retry(
        &self,
        commits: &BTreeMap<Partition, i64>,
    ) -> Result<(), FatalError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.client.commit(commits).await {
                Ok(()) => {
                    counter!(OFFSETS_COMMITTED).increment(commits.len() as u64);
                    debug!(partitions = commits.len(), "offsets committed");
                    return Ok(());
                }
                Err(CommitError::Retriable(cause)) => {
                    counter!(COMMIT_RETRIES).increment(1);
                    if attempts > self.commit_retries {
                        counter!(COMMIT_FAILURES).increment(1);
                        return Err(FatalError::CommitRetriesExhausted { attempts, cause });
                    }
                    warn!(attempts, error = %cause, "retriable commit failure");
                    tokio::time::sleep(COMMIT_RETRY_BACKOFF).await;
                }
                Err(CommitError::Fatal(cause)) => {
                    counter!(COMMIT_FAILURES).increment(1);
                    return Err(FatalError::Client(cause.into()));
                }
            }
        }
    }
}

#[async_trait]
impl Activity for ConsumerLoop {
    fn name(&self) -> &str {
        "consumer"
    }

    async fn process(&mut self) -> Result<(), FatalError> {
        let batch = self.client.poll(self.poll_timeout).await?;

        if !batch.assigned.is_empty() {
            self.handle_assigned(&batch.assigned);
        }
        if !batch.revoked.is_empty() {
            self.handle_revoked(&batch.revoked).await;
        }
        if !batch.records.is_empty() {
            histogram!(POLL_BATCH_SIZE).record(batch.records.len() as f64);
            for record in batch.records {
                self.route(record)?;
            }
        }

        self.reconcile_backpressure()?;
        self.check_watchdog()?;
        self.maybe_commit().await
    }

    /// One best-effort final commit, then close the client. A failure here
    /// is logged, never escalated: replay from the previous commit is the
    /// at-least-once contract.
    async fn close(&mut self) {
        let commits = self.tracker.collect_commits();
        if !commits.is_empty() {
            match self.client.commit(&commits).await {
                Ok(()) => {
                    counter!(OFFSETS_COMMITTED).increment(commits.len() as u64);
                    info!(partitions = commits.len(), "final commit complete");
                }
                Err(err) => error!(error = %err, "final commit failed"),
            }
        }
        self.client.close().await;
    }
}
