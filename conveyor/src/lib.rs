//! A worker-pool framework over a partitioned, ordered log. One consumer
//! loop polls records and fans them out to per-subpartition FIFO queues; N
//! workers drive user tasks over them, one subpartition at a time; an offset
//! tracker derives the highest safe commit point; byte budgets pause and
//! resume polling; a supervisor funnels the first fatal error into a
//! coordinated shutdown.
//!
//! Records are processed at least once: a commit at offset C means every
//! observed offset below C finished processing (success, skip, or fallback
//! delivery), so replay after a crash starts at C and never skips work.

pub mod activity;
pub mod config;
mod consumer;
pub mod error;
pub mod kafka;
pub mod log_client;
pub mod message;
pub mod metric_consts;
pub mod offset_tracker;
pub mod queues;
pub mod sink;
pub mod supervisor;
pub mod task;
pub mod test_utils;
pub mod types;
mod worker;

pub use config::{Config, FailureAction, KafkaConfig};
pub use error::{ClientError, CommitError, ConfigError, FatalError, ShutdownError, TrackerError};
pub use log_client::{LogClient, PolledBatch};
pub use message::AckableRecord;
pub use sink::FailureSink;
pub use supervisor::{ShutdownHandle, Supervisor, SupervisorBuilder};
pub use task::{KeyHashPartitioner, Partitioner, Task, TaskFactory, TaskOptions};
pub use types::{Partition, Record, Subpartition};
