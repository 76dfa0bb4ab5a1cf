use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::activity::Activity;
use crate::error::FatalError;
use crate::message::{AckableRecord, CompletionContext};
use crate::metric_consts::{RECORD_PROCESS_TIME, WORKER_IDLE_POLLS};
use crate::queues::QueueManager;
use crate::task::TaskSet;

/// One worker: picks a runnable subpartition, drives the user task on its
/// head record, and fails the record on the task's behalf if it errored
/// without completing it. Holds no framework lock across user code.
pub(crate) struct Worker {
    name: String,
    queues: Arc<QueueManager>,
    tasks: Arc<TaskSet>,
    ctx: Arc<CompletionContext>,
    stop: CancellationToken,
    sleep: Duration,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        queues: Arc<QueueManager>,
        tasks: Arc<TaskSet>,
        ctx: Arc<CompletionContext>,
        stop: CancellationToken,
        sleep: Duration,
    ) -> Self {
        Self {
            name: format!("worker-{id}"),
            queues,
            tasks,
            ctx,
            stop,
            sleep,
        }
    }
}

#[async_trait]
impl Activity for Worker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&mut self) -> Result<(), FatalError> {
        let Some((subpartition, record)) = self
            .queues
            .pick_runnable(&self.tasks, self.sleep, &self.stop)
            .await
        else {
            counter!(WORKER_IDLE_POLLS).increment(1);
            return Ok(());
        };

        let bytes = record.serialized_size;
        let Some(task) = self.tasks.get(&subpartition) else {
            // The subpartition was revoked between pick and here; the record
            // will be redelivered to the partition's next owner.
            self.queues.release(&subpartition, bytes);
            return Ok(());
        };

        let message = AckableRecord::new(record, subpartition.clone(), self.ctx.clone());
        let completion = message.clone();
        let started = Instant::now();
        let result = task.process(message).await;
        histogram!(RECORD_PROCESS_TIME).record(started.elapsed().as_secs_f64());
        if let Err(cause) = result {
            completion.fail_if_incomplete(cause).await;
        }
        self.queues.release(&subpartition, bytes);
        Ok(())
    }

    async fn close(&mut self) {
        debug!(worker = %self.name, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::FailureAction;
    use crate::offset_tracker::OffsetTracker;
    use crate::queues::QueueLimits;
    use crate::supervisor::ShutdownHandle;
    use crate::task::{Task, TaskFactory, TaskOptions};
    use crate::types::{Partition, Record, Subpartition};

    struct AckingTask {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl Task for AckingTask {
        async fn process(&self, message: AckableRecord) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(message.offset());
            message.ack().await;
            Ok(())
        }
    }

    struct AckingFactory {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    impl TaskFactory for AckingFactory {
        fn create(
            &self,
            _subpartition: &Subpartition,
            _options: &TaskOptions,
        ) -> anyhow::Result<Arc<dyn Task>> {
            Ok(Arc::new(AckingTask {
                seen: self.seen.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn worker_drives_the_task_and_releases_the_lease() {
        let partition = Partition::new("events", 0);
        let sub = Subpartition::new(partition.clone(), 0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let queues = Arc::new(QueueManager::new(QueueLimits {
            max_queue_bytes: 1024,
            max_total_bytes: None,
        }));
        let tasks = Arc::new(TaskSet::new(
            Arc::new(AckingFactory { seen: seen.clone() }),
            TaskOptions::new(),
        ));
        let tracker = Arc::new(OffsetTracker::new());
        tracker.ensure_partition(&partition);
        let ctx = Arc::new(CompletionContext {
            tracker: tracker.clone(),
            action: FailureAction::Shutdown,
            sink: None,
            shutdown: ShutdownHandle::new(),
        });

        tasks.ensure(&sub).unwrap();
        let record = Record::new(partition.clone(), 3, None, Some(vec![0; 16]), Vec::new());
        tracker
            .add_consumed(&partition, 3, record.received_at)
            .unwrap();
        queues.push(sub.clone(), record);

        let mut worker = Worker::new(
            0,
            queues.clone(),
            tasks,
            ctx,
            CancellationToken::new(),
            Duration::from_millis(10),
        );
        worker.process().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![3]);
        assert_eq!(queues.total_bytes(), 0);
        assert_eq!(tracker.next_commit(&partition), Some(4));
    }
}
