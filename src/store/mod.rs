//! Durable storage abstraction for jobs and execution history.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite, etc.). The scheduler treats the
//! store as the single source of truth across restarts.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::{Execution, ExecutionId, Job, JobId, JobUpdate, TerminalUpdate};

/// Errors that can occur during store operations.
///
/// The scheduler reacts differently per kind: `NotFound` and `Conflict`
/// surface to callers, `Transient` feeds bounded local retries.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write lost an optimistic race (e.g. duplicate key, terminal row).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Retryable I/O failure.
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Storage contract the scheduling core runs against.
///
/// Reads may be eventually consistent with concurrent writes; the scheduler
/// only relies on its own writes being visible to its own later reads.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Job operations

    /// Insert a new job. Fails with `Conflict` if the id already exists.
    async fn create_job(&self, job: Job) -> Result<(), StoreError>;

    /// Point read of one job.
    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError>;

    /// List jobs, optionally filtered by active flag, newest first.
    async fn list_jobs(&self, active: Option<bool>) -> Result<Vec<Job>, StoreError>;

    /// Snapshot of all jobs with `active = true`.
    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Apply a partial update, bumping `updated_at`. Returns the new row.
    async fn update_job(&self, id: &JobId, update: JobUpdate) -> Result<Job, StoreError>;

    /// Toggle the active flag.
    async fn set_job_active(&self, id: &JobId, active: bool) -> Result<(), StoreError>;

    /// Hard-delete a job, cascading its executions.
    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError>;

    // Execution operations

    /// Insert or replace an execution row, idempotent by `execution_id`.
    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Transition a `PENDING` row to `RUNNING`, stamping the start time.
    async fn record_attempt_start(
        &self,
        id: &ExecutionId,
        actual_start_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Write an attempt's final state, guarded by the row still being
    /// non-terminal. Returns whether the write took effect.
    async fn update_execution_terminal(
        &self,
        id: &ExecutionId,
        update: TerminalUpdate,
    ) -> Result<bool, StoreError>;

    /// Point read of one execution.
    async fn get_execution(&self, id: &ExecutionId) -> Result<Execution, StoreError>;

    /// Execution history for a job, newest first, at most `limit` rows.
    async fn list_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Rows still in `PENDING` or `RUNNING`, e.g. abandoned by a crash.
    async fn list_incomplete_executions(&self) -> Result<Vec<Execution>, StoreError>;
}
