//! The owning object: builds the shared fabric, spawns the consumer and
//! worker activities, and converges every failure and shutdown request onto
//! one close sequence: workers joined first, consumer last, sink closed,
//! first cause recorded.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::{run_supervised, Activity};
use crate::config::Config;
use crate::consumer::ConsumerLoop;
use crate::error::{ConfigError, FatalError, ShutdownError};
use crate::log_client::LogClient;
use crate::message::CompletionContext;
use crate::offset_tracker::OffsetTracker;
use crate::queues::{QueueLimits, QueueManager};
use crate::sink::FailureSink;
use crate::task::{KeyHashPartitioner, Partitioner, TaskFactory, TaskOptions, TaskSet};
use crate::worker::Worker;

struct HandleInner {
    trigger: CancellationToken,
    cause: Mutex<Option<Arc<FatalError>>>,
}

/// Shared shutdown state. Any holder can request a clean stop or fail the
/// pool with a cause; the first cause wins.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<HandleInner>,
}

impl ShutdownHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                trigger: CancellationToken::new(),
                cause: Mutex::new(None),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.trigger.is_cancelled()
    }

    /// Request a clean shutdown with no cause.
    pub fn request_shutdown(&self) {
        self.inner.trigger.cancel();
    }

    /// Record a fatal cause and trigger shutdown. Only the first cause is
    /// kept.
    pub(crate) fn fail(&self, cause: FatalError) {
        {
            let mut slot = self.inner.cause.lock().expect("cause lock poisoned");
            if slot.is_none() {
                *slot = Some(Arc::new(cause));
            } else {
                debug!(error = %cause, "additional failure after the first cause");
            }
        }
        self.inner.trigger.cancel();
    }

    pub fn cause(&self) -> Option<Arc<FatalError>> {
        self.inner.cause.lock().expect("cause lock poisoned").clone()
    }

    async fn triggered(&self) {
        self.inner.trigger.cancelled().await;
    }
}

pub struct SupervisorBuilder {
    config: Config,
    client: Option<Arc<dyn LogClient>>,
    factory: Option<Arc<dyn TaskFactory>>,
    partitioner: Option<Arc<dyn Partitioner>>,
    sink: Option<Arc<dyn FailureSink>>,
    task_options: TaskOptions,
}

impl SupervisorBuilder {
    pub fn log_client(mut self, client: Arc<dyn LogClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn task_factory(mut self, factory: Arc<dyn TaskFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    pub fn failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Passthrough options handed to every task instance.
    pub fn task_options(mut self, options: TaskOptions) -> Self {
        self.task_options = options;
        self
    }

    /// Validate the configuration, spawn the consumer and workers, and
    /// return without waiting. Must be called on a tokio runtime.
    pub fn start(self) -> Result<Supervisor, ConfigError> {
        self.config.validate()?;
        let client = self.client.ok_or(ConfigError::Missing("log client"))?;
        let factory = self.factory.ok_or(ConfigError::Missing("task factory"))?;
        if self.config.failure_action == crate::config::FailureAction::FallbackTopic
            && self.sink.is_none()
        {
            return Err(ConfigError::FailureSinkMissing);
        }
        let partitioner = self
            .partitioner
            .unwrap_or_else(|| Arc::new(KeyHashPartitioner::new(1)));

        let handle = ShutdownHandle::new();
        let workers_stop = CancellationToken::new();
        let consumer_stop = CancellationToken::new();
        let finished = CancellationToken::new();

        let tracker = Arc::new(OffsetTracker::new());
        let queues = Arc::new(QueueManager::new(QueueLimits {
            max_queue_bytes: self.config.queue_max_size_bytes,
            max_total_bytes: self.config.queue_total_max_size_bytes,
        }));
        let tasks = Arc::new(TaskSet::new(factory, self.task_options));
        let ctx = Arc::new(CompletionContext {
            tracker: tracker.clone(),
            action: self.config.failure_action,
            sink: self.sink.clone(),
            shutdown: handle.clone(),
        });

        let worker_handles: Vec<JoinHandle<()>> = (0..self.config.worker_threads_num)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    queues.clone(),
                    tasks.clone(),
                    ctx.clone(),
                    workers_stop.clone(),
                    self.config.worker_sleep(),
                );
                spawn_supervised(worker, handle.clone(), workers_stop.clone())
            })
            .collect();

        let consumer = ConsumerLoop::new(
            client,
            queues.clone(),
            tracker.clone(),
            tasks.clone(),
            partitioner,
            &self.config,
        );
        let consumer_handle = spawn_supervised(consumer, handle.clone(), consumer_stop.clone());

        info!(
            workers = self.config.worker_threads_num,
            topics = %self.config.topics,
            "worker pool started"
        );

        spawn_monitor(MonitorParts {
            handle: handle.clone(),
            workers_stop,
            consumer_stop,
            finished: finished.clone(),
            worker_handles,
            consumer_handle,
            sink: self.sink,
            tasks,
            grace: self.config.shutdown_grace(),
        });

        Ok(Supervisor { handle, finished })
    }
}

fn spawn_supervised<A: Activity + 'static>(
    activity: A,
    handle: ShutdownHandle,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let name = activity.name().to_string();
    tokio::spawn(async move {
        let run = run_supervised(activity, handle.clone(), stop);
        if AssertUnwindSafe(run).catch_unwind().await.is_err() {
            handle.fail(FatalError::ActivityPanicked { activity: name });
        }
    })
}

struct MonitorParts {
    handle: ShutdownHandle,
    workers_stop: CancellationToken,
    consumer_stop: CancellationToken,
    finished: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    consumer_handle: JoinHandle<()>,
    sink: Option<Arc<dyn FailureSink>>,
    tasks: Arc<TaskSet>,
    grace: std::time::Duration,
}

/// Waits for the shutdown trigger, then runs the close sequence: stop and
/// join workers (abort past the grace period), then stop and join the
/// consumer so its final commit observes late completions, close tasks and
/// the failure sink, and mark the pool finished.
fn spawn_monitor(parts: MonitorParts) {
    tokio::spawn(async move {
        let MonitorParts {
            handle,
            workers_stop,
            consumer_stop,
            finished,
            worker_handles,
            consumer_handle,
            sink,
            tasks,
            grace,
        } = parts;

        handle.triggered().await;
        info!("shutdown initiated");

        workers_stop.cancel();
        let worker_aborts: Vec<_> = worker_handles
            .iter()
            .map(|worker| worker.abort_handle())
            .collect();
        if tokio::time::timeout(grace, futures::future::join_all(worker_handles))
            .await
            .is_err()
        {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "workers did not stop within the grace period; aborting"
            );
            for abort in worker_aborts {
                abort.abort();
            }
        }

        consumer_stop.cancel();
        let consumer_abort = consumer_handle.abort_handle();
        if tokio::time::timeout(grace, consumer_handle).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "consumer did not stop within the grace period; aborting"
            );
            consumer_abort.abort();
        }

        tasks.close_all().await;
        if let Some(sink) = sink {
            sink.close().await;
        }

        finished.cancel();
        match handle.cause() {
            Some(cause) => warn!(cause = %cause, "worker pool closed after failure"),
            None => info!("worker pool closed"),
        }
    });
}

pub struct Supervisor {
    handle: ShutdownHandle,
    finished: CancellationToken,
}

impl Supervisor {
    pub fn builder(config: Config) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            client: None,
            factory: None,
            partitioner: None,
            sink: None,
            task_options: TaskOptions::new(),
        }
    }

    /// Trigger shutdown and wait for the close sequence to finish.
    /// Idempotent while the pool is closing; once closed, further calls
    /// fail with [`ShutdownError::AlreadyClosed`].
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        if self.finished.is_cancelled() {
            return Err(ShutdownError::AlreadyClosed);
        }
        self.handle.request_shutdown();
        self.finished.cancelled().await;
        Ok(())
    }

    /// Wait for the pool to close without triggering shutdown; returns when
    /// an internal failure or another caller closes it.
    pub async fn join(&self) {
        self.finished.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// The first fatal error, if the pool closed because of one.
    pub fn cause(&self) -> Option<Arc<FatalError>> {
        self.handle.cause()
    }

    /// Handle for external shutdown triggers (signal handlers and the like).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cause_wins() {
        let handle = ShutdownHandle::new();
        handle.fail(FatalError::InvariantViolation("first".to_string()));
        handle.fail(FatalError::InvariantViolation("second".to_string()));
        let cause = handle.cause().unwrap();
        assert!(cause.to_string().contains("first"));
        assert!(handle.is_shutting_down());
    }

    #[test]
    fn clean_request_leaves_no_cause() {
        let handle = ShutdownHandle::new();
        handle.request_shutdown();
        assert!(handle.is_shutting_down());
        assert!(handle.cause().is_none());
    }
}
