use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ClientError, CommitError};
use crate::types::{Partition, Record};

/// One poll cycle's worth of events. Rebalance notifications ride on the
/// batch instead of callbacks so every assignment mutation happens on the
/// consumer loop.
#[derive(Debug, Default)]
pub struct PolledBatch {
    pub assigned: Vec<Partition>,
    pub revoked: Vec<Partition>,
    pub records: Vec<Record>,
}

impl PolledBatch {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.revoked.is_empty() && self.records.is_empty()
    }
}

/// Abstract partitioned-log client. Implementations subscribe at
/// construction, force auto-commit off, and reject overrides of the options
/// the framework manages.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Poll for records and rebalance events, blocking up to `timeout`.
    /// Records for paused partitions must not be returned.
    async fn poll(&self, timeout: Duration) -> Result<PolledBatch, ClientError>;

    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError>;

    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError>;

    /// Synchronously commit the given next-offsets (one past the last
    /// processed offset per partition). Errors are classified so the caller
    /// can retry what is retriable.
    async fn commit(&self, offsets: &BTreeMap<Partition, i64>) -> Result<(), CommitError>;

    async fn close(&self);
}
