//! chime - a durable cron scheduler for HTTP callbacks.
//!
//! Jobs carry a six-field cron expression (seconds resolution, UTC) and a
//! target URL. The scheduler keeps the upcoming occurrences in an in-memory
//! priority queue, dispatches due ones to a bounded worker pool that POSTs
//! to the target, records every attempt in the store, and retries failures
//! with capped exponential backoff for at-least-once delivery.

pub mod api;
pub mod config;
pub mod core;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::Config;
pub use core::{
    BackoffPolicy, CronError, CronExpr, Execution, ExecutionId, ExecutionStatus, ExecutionType,
    Job, JobError, JobId, JobUpdate, TerminalUpdate,
};
pub use queue::{DueQueue, QueueEntry};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle, SchedulerState};
pub use store::{JobStore, MemoryStore, SqliteStore, StoreError};
pub use worker::{AttemptOutcome, AttemptTask, ErrorKind, PoolSaturated, WorkerPool};
