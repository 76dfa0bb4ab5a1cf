use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use metrics::counter;
use siphasher::sip::SipHasher13;
use tracing::debug;

use crate::message::AckableRecord;
use crate::metric_consts::{TASKS_CLOSED, TASKS_CREATED};
use crate::types::{Partition, Record, Subpartition};

/// Free-form options handed to every task instance at creation.
pub type TaskOptions = HashMap<String, String>;

/// User-supplied record processing. One instance exists per subpartition and
/// is never driven by two workers at once, so implementations may keep
/// per-subpartition state behind interior mutability without contention.
#[async_trait]
pub trait Task: Send + Sync {
    /// Whether this task is ready to take the next record of the
    /// subpartition. Called under the scheduler lock; must be cheap and
    /// side-effect free.
    fn accept(&self, _subpartition: &Subpartition) -> bool {
        true
    }

    /// Process one record. The task must complete `message` exactly once,
    /// eventually, and in offset order per subpartition; it may move the
    /// message into a spawned task and complete it later. Returning an error
    /// without completing the message makes the worker fail it on the task's
    /// behalf.
    async fn process(&self, message: AckableRecord) -> anyhow::Result<()>;

    /// Called once when the subpartition is revoked or the pool shuts down.
    async fn close(&self) {}
}

/// Builds a task per subpartition.
pub trait TaskFactory: Send + Sync {
    fn create(
        &self,
        subpartition: &Subpartition,
        options: &TaskOptions,
    ) -> anyhow::Result<Arc<dyn Task>>;
}

impl<F> TaskFactory for F
where
    F: Fn(&Subpartition, &TaskOptions) -> anyhow::Result<Arc<dyn Task>> + Send + Sync,
{
    fn create(
        &self,
        subpartition: &Subpartition,
        options: &TaskOptions,
    ) -> anyhow::Result<Arc<dyn Task>> {
        self(subpartition, options)
    }
}

/// Maps a record to a subpartition id. Must be deterministic per record.
pub trait Partitioner: Send + Sync {
    fn subpartition_for(&self, record: &Record) -> u32;
}

/// Default partitioner: SipHash-1-3 over the record key, modulo the
/// subpartition count. Keyless records hash their offset so they spread
/// without breaking determinism.
pub struct KeyHashPartitioner {
    subpartitions: u32,
}

impl KeyHashPartitioner {
    pub fn new(subpartitions: u32) -> Self {
        Self {
            subpartitions: subpartitions.max(1),
        }
    }
}

impl Partitioner for KeyHashPartitioner {
    fn subpartition_for(&self, record: &Record) -> u32 {
        let mut hasher = SipHasher13::new();
        match &record.key {
            Some(key) => hasher.write(key),
            None => hasher.write(&record.offset.to_be_bytes()),
        }
        (hasher.finish() % u64::from(self.subpartitions)) as u32
    }
}

/// Live task instances, one per subpartition. The consumer creates entries
/// when it routes the first record of a subpartition; workers only read.
pub(crate) struct TaskSet {
    factory: Arc<dyn TaskFactory>,
    options: TaskOptions,
    tasks: RwLock<HashMap<Subpartition, Arc<dyn Task>>>,
}

impl TaskSet {
    pub(crate) fn new(factory: Arc<dyn TaskFactory>, options: TaskOptions) -> Self {
        Self {
            factory,
            options,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, subpartition: &Subpartition) -> Option<Arc<dyn Task>> {
        let tasks = self.tasks.read().expect("task set lock poisoned");
        tasks.get(subpartition).cloned()
    }

    /// Cheap acceptance probe used by the scheduler. A subpartition without a
    /// task instance is not runnable.
    pub(crate) fn accepts(&self, subpartition: &Subpartition) -> bool {
        let tasks = self.tasks.read().expect("task set lock poisoned");
        tasks
            .get(subpartition)
            .map(|task| task.accept(subpartition))
            .unwrap_or(false)
    }

    /// Create the task for a subpartition if it does not exist yet. Only the
    /// consumer loop calls this, so creation never races.
    pub(crate) fn ensure(&self, subpartition: &Subpartition) -> anyhow::Result<Arc<dyn Task>> {
        if let Some(task) = self.get(subpartition) {
            return Ok(task);
        }
        let task = self.factory.create(subpartition, &self.options)?;
        counter!(TASKS_CREATED).increment(1);
        debug!(subpartition = %subpartition, "task created");
        let mut tasks = self.tasks.write().expect("task set lock poisoned");
        Ok(tasks.entry(subpartition.clone()).or_insert(task).clone())
    }

    /// Close and drop every task of a revoked partition.
    pub(crate) async fn close_partition(&self, partition: &Partition) {
        let removed = {
            let mut tasks = self.tasks.write().expect("task set lock poisoned");
            let keys: Vec<Subpartition> = tasks
                .keys()
                .filter(|sub| sub.partition == *partition)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| tasks.remove(&key).map(|task| (key, task)))
                .collect::<Vec<_>>()
        };
        for (subpartition, task) in removed {
            task.close().await;
            counter!(TASKS_CLOSED).increment(1);
            debug!(subpartition = %subpartition, "task closed");
        }
    }

    /// Close everything; used on pool shutdown.
    pub(crate) async fn close_all(&self) {
        let removed = {
            let mut tasks = self.tasks.write().expect("task set lock poisoned");
            tasks.drain().collect::<Vec<_>>()
        };
        for (subpartition, task) in removed {
            task.close().await;
            counter!(TASKS_CLOSED).increment(1);
            debug!(subpartition = %subpartition, "task closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_key(key: Option<&[u8]>, offset: i64) -> Record {
        Record::new(
            Partition::new("events", 0),
            offset,
            key.map(|k| k.to_vec()),
            None,
            Vec::new(),
        )
    }

    #[test]
    fn key_hash_is_deterministic_and_bounded() {
        let partitioner = KeyHashPartitioner::new(8);
        let a = partitioner.subpartition_for(&record_with_key(Some(b"user-1"), 0));
        let b = partitioner.subpartition_for(&record_with_key(Some(b"user-1"), 99));
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn keyless_records_fall_back_to_offset() {
        let partitioner = KeyHashPartitioner::new(8);
        let a = partitioner.subpartition_for(&record_with_key(None, 7));
        let b = partitioner.subpartition_for(&record_with_key(None, 7));
        assert_eq!(a, b);
    }

    #[test]
    fn zero_subpartitions_degrades_to_one() {
        let partitioner = KeyHashPartitioner::new(0);
        assert_eq!(
            partitioner.subpartition_for(&record_with_key(Some(b"k"), 0)),
            0
        );
    }
}
