//! API response types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{Execution, Job};

fn to_iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub scheduler_running: bool,
}

impl HealthResponse {
    pub fn new(scheduler_running: bool) -> Self {
        Self {
            status: "UP",
            version: env!("CARGO_PKG_VERSION"),
            scheduler_running,
        }
    }
}

/// Job representation returned by the API.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub schedule: String,
    pub target_url: String,
    pub execution_type: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
    /// The next instant the schedule fires, if one exists.
    pub next_run_time: Option<String>,
}

impl JobResponse {
    pub fn from_job(job: &Job) -> Self {
        let next_run_time = job
            .cron()
            .ok()
            .and_then(|cron| cron.next_after(Utc::now()).ok())
            .map(to_iso);

        Self {
            job_id: job.job_id.to_string(),
            schedule: job.schedule.clone(),
            target_url: job.target_url.clone(),
            execution_type: job.execution_type.to_string(),
            active: job.active,
            created_at: to_iso(job.created_at),
            updated_at: to_iso(job.updated_at),
            next_run_time,
        }
    }
}

/// List of jobs response.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub count: usize,
}

/// Execution history row.
#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub job_id: String,
    pub scheduled_time: String,
    pub actual_start_time: Option<String>,
    pub finished_at: Option<String>,
    pub status: String,
    pub http_status: Option<u16>,
    pub duration_ms: Option<i64>,
    /// Lateness of the attempt; derived, never stored.
    pub drift_ms: Option<i64>,
    pub attempt: u32,
    pub error_message: Option<String>,
    pub created_at: String,
}

impl From<Execution> for ExecutionResponse {
    fn from(execution: Execution) -> Self {
        Self {
            execution_id: execution.execution_id.to_string(),
            job_id: execution.job_id.to_string(),
            scheduled_time: to_iso(execution.scheduled_time),
            actual_start_time: execution.actual_start_time.map(to_iso),
            finished_at: execution.finished_at.map(to_iso),
            status: execution.status.to_string(),
            http_status: execution.http_status,
            duration_ms: execution.duration_ms,
            drift_ms: execution.drift_ms(),
            attempt: execution.attempt,
            error_message: execution.error_message,
            created_at: to_iso(execution.created_at),
        }
    }
}

/// Execution history list.
#[derive(Debug, Serialize)]
pub struct ExecutionListResponse {
    pub executions: Vec<ExecutionResponse>,
    pub count: usize,
}

/// Response to an ad-hoc dispatch.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub execution_id: String,
    pub job_id: String,
    pub message: String,
}

/// Aggregate execution statistics for one job.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub job_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried: usize,
    pub avg_duration_ms: Option<i64>,
    pub avg_drift_ms: Option<i64>,
    pub last_execution_at: Option<String>,
}

/// Generic message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
