use async_trait::async_trait;

use crate::types::Record;

/// Sidecar for records whose processing failed under the fallback action.
/// `deliver` returning `Ok` means the record is durably accepted; only then
/// is its offset marked processed. Implementations must be safe to share
/// across workers.
#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn deliver(&self, record: &Record, cause: &anyhow::Error) -> anyhow::Result<()>;

    /// Flush and release resources; called once during pool shutdown.
    async fn close(&self) {}
}
