//! The per-record completion handle given to user tasks. Completing it is the
//! only path by which a record moves from consumed to processed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::config::FailureAction;
use crate::error::{FatalError, TrackerError};
use crate::metric_consts::{
    OBSERVER_MISUSE, RECORDS_FAILED, RECORDS_PROCESSED, RECORDS_SENT_TO_FALLBACK, RECORDS_SKIPPED,
};
use crate::offset_tracker::OffsetTracker;
use crate::sink::FailureSink;
use crate::supervisor::ShutdownHandle;
use crate::types::{Partition, Record, Subpartition};

/// Everything a completion needs to route itself: the tracker, the configured
/// failure action, the optional fallback sink, and a way to fail the pool.
pub(crate) struct CompletionContext {
    pub(crate) tracker: Arc<OffsetTracker>,
    pub(crate) action: FailureAction,
    pub(crate) sink: Option<Arc<dyn FailureSink>>,
    pub(crate) shutdown: ShutdownHandle,
}

struct Inner {
    record: Record,
    subpartition: Subpartition,
    completed: AtomicBool,
    ctx: Arc<CompletionContext>,
}

/// A record plus its one-shot completion. Tasks call [`ack`](Self::ack) or
/// [`nack`](Self::nack) exactly once, in offset order per subpartition; the
/// handle may be cloned and moved into a spawned task to complete later.
/// Extra completions are reported and ignored.
#[derive(Clone)]
pub struct AckableRecord {
    inner: Arc<Inner>,
}

impl AckableRecord {
    pub(crate) fn new(
        record: Record,
        subpartition: Subpartition,
        ctx: Arc<CompletionContext>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                record,
                subpartition,
                completed: AtomicBool::new(false),
                ctx,
            }),
        }
    }

    pub fn record(&self) -> &Record {
        &self.inner.record
    }

    pub fn subpartition(&self) -> &Subpartition {
        &self.inner.subpartition
    }

    pub fn partition(&self) -> &Partition {
        &self.inner.record.partition
    }

    pub fn offset(&self) -> i64 {
        self.inner.record.offset
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Report successful processing.
    pub async fn ack(&self) {
        if self.inner.completed.swap(true, Ordering::SeqCst) {
            self.report_misuse("double_complete", "ack on an already completed record");
            return;
        }
        self.mark_processed();
        counter!(RECORDS_PROCESSED).increment(1);
    }

    /// Report failed processing; the configured failure action decides what
    /// happens to the record.
    pub async fn nack(&self, cause: anyhow::Error) {
        if self.inner.completed.swap(true, Ordering::SeqCst) {
            self.report_misuse("double_complete", "nack on an already completed record");
            return;
        }
        self.route_failure(cause).await;
    }

    /// Worker-side failure path for tasks that returned an error without
    /// completing the record themselves.
    pub(crate) async fn fail_if_incomplete(&self, cause: anyhow::Error) {
        if self.inner.completed.swap(true, Ordering::SeqCst) {
            warn!(
                subpartition = %self.inner.subpartition,
                offset = self.offset(),
                error = %cause,
                "task returned an error after completing the record"
            );
            return;
        }
        self.route_failure(cause).await;
    }

    async fn route_failure(&self, cause: anyhow::Error) {
        counter!(RECORDS_FAILED).increment(1);
        match self.inner.ctx.action {
            FailureAction::Shutdown => {
                self.inner.ctx.shutdown.fail(FatalError::Processing {
                    partition: self.partition().clone(),
                    offset: self.offset(),
                    cause,
                });
            }
            FailureAction::Skip => {
                warn!(
                    subpartition = %self.inner.subpartition,
                    offset = self.offset(),
                    error = %cause,
                    "skipping failed record"
                );
                counter!(RECORDS_SKIPPED).increment(1);
                self.mark_processed();
            }
            FailureAction::FallbackTopic => {
                let Some(sink) = self.inner.ctx.sink.clone() else {
                    self.inner.ctx.shutdown.fail(FatalError::InvariantViolation(
                        "fallback_topic action configured without a failure sink".to_string(),
                    ));
                    return;
                };
                match sink.deliver(&self.inner.record, &cause).await {
                    Ok(()) => {
                        counter!(RECORDS_SENT_TO_FALLBACK).increment(1);
                        debug!(
                            subpartition = %self.inner.subpartition,
                            offset = self.offset(),
                            "failed record handed to the fallback sink"
                        );
                        self.mark_processed();
                    }
                    Err(err) => {
                        self.inner.ctx.shutdown.fail(FatalError::FallbackDelivery {
                            partition: self.partition().clone(),
                            offset: self.offset(),
                            cause: err,
                        });
                    }
                }
            }
        }
    }

    fn mark_processed(&self) {
        match self
            .inner
            .ctx
            .tracker
            .add_processed(self.partition(), self.offset())
        {
            Ok(()) => {}
            Err(TrackerError::UntrackedPartition { partition }) => {
                // Rebalance race: the partition was revoked while this record
                // was in flight. Replay on the new owner covers it.
                debug!(partition = %partition, offset = self.offset(),
                    "completion for a revoked partition dropped");
            }
            Err(err) => {
                self.report_misuse("unknown_offset", &err.to_string());
            }
        }
    }

    fn report_misuse(&self, kind: &'static str, detail: &str) {
        counter!(OBSERVER_MISUSE, "kind" => kind).increment(1);
        warn!(
            subpartition = %self.inner.subpartition,
            offset = self.offset(),
            detail,
            "record completion misuse"
        );
    }
}
