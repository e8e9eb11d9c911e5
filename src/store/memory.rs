//! In-memory store implementation.
//!
//! Thread-safe backend for tests and development. Data is not persisted
//! across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{JobStore, StoreError};
use crate::core::{
    Execution, ExecutionId, ExecutionStatus, Job, JobId, JobUpdate, TerminalUpdate,
};

/// In-memory store backend.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Transient("store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(format!("job: {}", job.job_id)));
        }
        jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))
    }

    async fn list_jobs(&self, active: Option<bool>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|job| active.map_or(true, |want| job.active == want))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.list_jobs(Some(true)).await
    }

    async fn update_job(&self, id: &JobId, update: JobUpdate) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))?;

        if let Some(schedule) = update.schedule {
            job.schedule = schedule;
        }
        if let Some(target_url) = update.target_url {
            job.target_url = target_url;
        }
        if let Some(active) = update.active {
            job.active = active;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn set_job_active(&self, id: &JobId, active: bool) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))?;
        job.active = active;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        jobs.remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))?;

        // Cascade: drop this job's execution history.
        let mut executions = self.executions.write().map_err(|_| poisoned())?;
        executions.retain(|_, execution| execution.job_id != *id);
        Ok(())
    }

    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().map_err(|_| poisoned())?;
        executions.insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn record_attempt_start(
        &self,
        id: &ExecutionId,
        actual_start_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().map_err(|_| poisoned())?;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("execution: {}", id)))?;

        if execution.status != ExecutionStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "execution {} is {}, expected PENDING",
                id, execution.status
            )));
        }
        execution.status = ExecutionStatus::Running;
        execution.actual_start_time = Some(actual_start_time);
        Ok(())
    }

    async fn update_execution_terminal(
        &self,
        id: &ExecutionId,
        update: TerminalUpdate,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().map_err(|_| poisoned())?;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("execution: {}", id)))?;

        if execution.status.is_terminal() {
            return Ok(false);
        }
        execution.status = update.status;
        execution.http_status = update.http_status;
        execution.duration_ms = update.duration_ms;
        execution.finished_at = Some(update.finished_at);
        execution.error_message = update.error_message;
        Ok(true)
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Execution, StoreError> {
        let executions = self.executions.read().map_err(|_| poisoned())?;
        executions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution: {}", id)))
    }

    async fn list_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = executions
            .values()
            .filter(|execution| execution.job_id == *job_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.attempt.cmp(&a.attempt))
        });
        result.truncate(limit);
        Ok(result)
    }

    async fn list_incomplete_executions(&self) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read().map_err(|_| poisoned())?;
        Ok(executions
            .values()
            .filter(|execution| {
                matches!(
                    execution.status,
                    ExecutionStatus::Pending | ExecutionStatus::Running
                )
            })
            .cloned()
            .collect())
    }
}
