pub const RECORDS_RECEIVED: &str = "conveyor_records_received";
pub const RECORDS_PROCESSED: &str = "conveyor_records_processed";
pub const RECORDS_FAILED: &str = "conveyor_records_failed";
pub const RECORDS_SKIPPED: &str = "conveyor_records_skipped";
pub const RECORDS_SENT_TO_FALLBACK: &str = "conveyor_records_sent_to_fallback";
pub const RECORDS_DROPPED_ON_REVOKE: &str = "conveyor_records_dropped_on_revoke";
pub const OBSERVER_MISUSE: &str = "conveyor_observer_misuse";
pub const OFFSETS_COMMITTED: &str = "conveyor_offsets_committed";
pub const COMMIT_FAILURES: &str = "conveyor_commit_failures";
pub const COMMIT_RETRIES: &str = "conveyor_commit_retries";
pub const PARTITIONS_ASSIGNED: &str = "conveyor_partitions_assigned";
pub const PARTITIONS_REVOKED: &str = "conveyor_partitions_revoked";
pub const PARTITIONS_PAUSED: &str = "conveyor_partitions_paused";
pub const PARTITIONS_RESUMED: &str = "conveyor_partitions_resumed";
pub const QUEUE_BYTES: &str = "conveyor_queue_bytes";
pub const QUEUED_RECORDS: &str = "conveyor_queued_records";
pub const POLL_BATCH_SIZE: &str = "conveyor_poll_batch_size";
pub const RECORD_PROCESS_TIME: &str = "conveyor_record_process_time";
pub const WORKER_IDLE_POLLS: &str = "conveyor_worker_idle_polls";
pub const OLDEST_INFLIGHT_AGE_MS: &str = "conveyor_oldest_inflight_age_ms";
pub const TASKS_CREATED: &str = "conveyor_tasks_created";
pub const TASKS_CLOSED: &str = "conveyor_tasks_closed";
