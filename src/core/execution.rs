//! Execution records: one row per delivery attempt.
//!
//! An occurrence of a job produces one or more executions, numbered from
//! attempt 1. `RETRYING` closes an attempt that will be retried; the retry
//! is a fresh row with an incremented attempt number. `SUCCESS` and
//! `FAILED` are terminal and never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{ExecutionId, JobId};

/// Status of an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Row created, attempt not yet started.
    Pending,
    /// The HTTP call is in flight.
    Running,
    /// The attempt got a 2xx response.
    Success,
    /// The attempt failed and will not be retried.
    Failed,
    /// The attempt failed and a retry has been scheduled.
    Retrying,
}

impl ExecutionStatus {
    /// Terminal statuses are monotone: once written, never rewritten.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Retrying => "RETRYING",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "RETRYING" => Ok(ExecutionStatus::Retrying),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    /// The instant the occurrence was due (the occurrence origin, shared by
    /// every attempt of the occurrence).
    pub scheduled_time: DateTime<Utc>,
    /// When the worker actually began the HTTP call.
    pub actual_start_time: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub http_status: Option<u16>,
    pub duration_ms: Option<i64>,
    /// 1-based attempt number within the occurrence.
    pub attempt: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Create a fresh `PENDING` row for an attempt about to be dispatched.
    pub fn pending(
        job_id: JobId,
        scheduled_time: DateTime<Utc>,
        attempt: u32,
    ) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            job_id,
            scheduled_time,
            actual_start_time: None,
            finished_at: None,
            status: ExecutionStatus::Pending,
            http_status: None,
            duration_ms: None,
            attempt,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Lateness of the attempt, defined only once it actually started.
    pub fn drift_ms(&self) -> Option<i64> {
        self.actual_start_time
            .map(|start| (start - self.scheduled_time).num_milliseconds())
    }
}

/// Fields written when an attempt reaches its final state.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub status: ExecutionStatus,
    pub http_status: Option<u16>,
    pub duration_ms: Option<i64>,
    pub finished_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl TerminalUpdate {
    pub fn success(http_status: u16, duration_ms: i64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            http_status: Some(http_status),
            duration_ms: Some(duration_ms),
            finished_at: Utc::now(),
            error_message: None,
        }
    }

    pub fn failed(
        http_status: Option<u16>,
        duration_ms: Option<i64>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            http_status,
            duration_ms,
            finished_at: Utc::now(),
            error_message: Some(error_message.into()),
        }
    }

    pub fn retrying(
        http_status: Option<u16>,
        duration_ms: Option<i64>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Retrying,
            http_status,
            duration_ms,
            finished_at: Utc::now(),
            error_message: Some(error_message.into()),
        }
    }
}
