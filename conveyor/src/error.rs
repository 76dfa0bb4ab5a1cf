use thiserror::Error;

use crate::types::{Partition, Subpartition};

/// Fatal errors. The first one raised by any activity becomes the shutdown
/// cause; everything after it is logged and dropped.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("record processing failed on {partition} at offset {offset}: {cause}")]
    Processing {
        partition: Partition,
        offset: i64,
        cause: anyhow::Error,
    },

    #[error(
        "record on {partition} in flight for {age_ms}ms, over the {timeout_ms}ms processing timeout"
    )]
    ProcessingTimeout {
        partition: Partition,
        age_ms: u64,
        timeout_ms: u64,
    },

    #[error("offset commit failed after {attempts} attempts: {cause}")]
    CommitRetriesExhausted { attempts: u32, cause: anyhow::Error },

    #[error("log client failure: {0}")]
    Client(#[from] ClientError),

    #[error("fallback delivery failed for {partition} at offset {offset}: {cause}")]
    FallbackDelivery {
        partition: Partition,
        offset: i64,
        cause: anyhow::Error,
    },

    #[error("task init failed for {subpartition}: {cause}")]
    TaskInit {
        subpartition: Subpartition,
        cause: anyhow::Error,
    },

    #[error("{activity} panicked")]
    ActivityPanicked { activity: String },

    #[error("offset tracking invariant violated: {0}")]
    InvariantViolation(String),
}

/// Non-commit failures reported by a log client. Always fatal.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ClientError(pub anyhow::Error);

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError(err)
    }
}

/// Commit failures, classified so the consumer knows what is worth retrying.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("retriable commit failure: {0}")]
    Retriable(anyhow::Error),
    #[error("fatal commit failure: {0}")]
    Fatal(anyhow::Error),
}

/// Rejected configuration. Raised at construction, before any thread starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("the fallback_topic failure action requires record_processing_fallback_topic")]
    FallbackTopicMissing,
    #[error("the fallback_topic failure action requires a failure sink")]
    FailureSinkMissing,
    #[error("{key} is managed by the framework and cannot be overridden")]
    ForcedOptionOverride { key: String },
    #[error("{field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("supervisor already closed")]
    AlreadyClosed,
}

/// Rejections from the offset tracker. Monotonicity violations are fatal;
/// the rest surface as observer misuse at the completion boundary.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("offset {offset} was never consumed on {partition}")]
    UnknownOffset { partition: Partition, offset: i64 },
    #[error("offset {offset} on {partition} already marked processed")]
    AlreadyProcessed { partition: Partition, offset: i64 },
    #[error("offset {offset} on {partition} is not above the consumed high water mark {high_water}")]
    NonMonotonic {
        partition: Partition,
        offset: i64,
        high_water: i64,
    },
    #[error("{partition} is not tracked")]
    UntrackedPartition { partition: Partition },
}
