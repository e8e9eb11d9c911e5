//! API request handlers.
//!
//! Thin adapters over the store and the scheduler handle: validation and
//! JSON shaping here, scheduling semantics in the core.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

use crate::core::{ExecutionStatus, ExecutionType, Job, JobId, JobUpdate};
use crate::scheduler::SchedulerHandle;
use crate::store::JobStore;

use super::errors::ApiError;
use super::responses::{
    ExecutionListResponse, ExecutionResponse, HealthResponse, JobListResponse, JobResponse,
    MessageResponse, StatsResponse, TriggerResponse,
};

/// Shared application state for API handlers.
pub struct ApiState<S: JobStore> {
    pub handle: SchedulerHandle,
    pub store: Arc<S>,
}

impl<S: JobStore> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

/// Request body for creating a job.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Six-field cron expression with seconds.
    pub schedule: String,
    /// The HTTP endpoint to call when the job fires.
    pub target_url: String,
    #[serde(default)]
    pub execution_type: ExecutionType,
}

/// Query parameters for listing jobs.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub active: Option<bool>,
}

/// Query parameters for listing executions.
#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::from_str(raw).map_err(|_| ApiError::NotFound(format!("job: {}", raw)))
}

/// Health check endpoint.
pub async fn health<S: JobStore>(State(state): State<ApiState<S>>) -> Json<HealthResponse> {
    Json(HealthResponse::new(state.handle.is_running().await))
}

/// Create a new scheduled job.
pub async fn create_job<S: JobStore>(
    State(state): State<ApiState<S>>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = Job::new(request.schedule, request.target_url, request.execution_type)?;

    state.store.create_job(job.clone()).await?;
    state.handle.reload_jobs().await?;

    Ok((StatusCode::CREATED, Json(JobResponse::from_job(&job))))
}

/// List jobs, optionally filtered by active flag.
pub async fn list_jobs<S: JobStore>(
    State(state): State<ApiState<S>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let jobs = state.store.list_jobs(query.active).await?;
    let jobs: Vec<JobResponse> = jobs.iter().map(JobResponse::from_job).collect();
    let count = jobs.len();

    Ok(Json(JobListResponse { jobs, count }))
}

/// Get a single job.
pub async fn get_job<S: JobStore>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.store.get_job(&job_id).await?;

    Ok(Json(JobResponse::from_job(&job)))
}

/// Update a job's schedule, target URL, or active flag.
pub async fn update_job<S: JobStore>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
    Json(update): Json<JobUpdate>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    update.validate()?;

    let job = state.store.update_job(&job_id, update).await?;
    state.handle.reload_jobs().await?;

    Ok(Json(JobResponse::from_job(&job)))
}

/// Soft-delete a job: deactivate it and drop its queue entry.
pub async fn delete_job<S: JobStore>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.handle.pause(job_id).await?;

    Ok(Json(MessageResponse {
        message: format!("job {} deactivated", job_id),
    }))
}

/// Fire an ad-hoc occurrence of a job right now.
pub async fn run_job<S: JobStore>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let execution_id = state.handle.dispatch_now(job_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            execution_id: execution_id.to_string(),
            job_id: job_id.to_string(),
            message: "dispatched".to_string(),
        }),
    ))
}

/// Pause a job.
pub async fn pause_job<S: JobStore>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.handle.pause(job_id).await?;

    Ok(Json(MessageResponse {
        message: format!("job {} paused", job_id),
    }))
}

/// Resume a paused job.
pub async fn resume_job<S: JobStore>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.handle.resume(job_id).await?;

    Ok(Json(MessageResponse {
        message: format!("job {} resumed", job_id),
    }))
}

/// Execution history for a job, newest first.
pub async fn list_executions<S: JobStore>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ExecutionListResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    // Surface NotFound for unknown jobs rather than an empty list.
    state.store.get_job(&job_id).await?;

    let executions = state.store.list_executions(&job_id, query.limit).await?;
    let executions: Vec<ExecutionResponse> =
        executions.into_iter().map(ExecutionResponse::from).collect();
    let count = executions.len();

    Ok(Json(ExecutionListResponse { executions, count }))
}

/// Aggregate statistics over a job's recent executions.
pub async fn job_stats<S: JobStore>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<StatsResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.store.get_job(&job_id).await?;

    let executions = state.store.list_executions(&job_id, 100).await?;

    let total = executions.len();
    let succeeded = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Success)
        .count();
    let failed = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Failed)
        .count();
    let retried = executions
        .iter()
        .filter(|e| e.status == ExecutionStatus::Retrying)
        .count();

    let durations: Vec<i64> = executions.iter().filter_map(|e| e.duration_ms).collect();
    let avg_duration_ms = average(&durations);
    let drifts: Vec<i64> = executions.iter().filter_map(|e| e.drift_ms()).collect();
    let avg_drift_ms = average(&drifts);

    let last_execution_at: Option<DateTime<Utc>> =
        executions.iter().map(|e| e.created_at).max();

    Ok(Json(StatsResponse {
        job_id: job_id.to_string(),
        total,
        succeeded,
        failed,
        retried,
        avg_duration_ms,
        avg_drift_ms,
        last_execution_at: last_execution_at.map(|t| t.to_rfc3339()),
    }))
}

fn average(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<i64>() / values.len() as i64)
}
