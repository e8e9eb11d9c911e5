//! Job definition: a cron schedule bound to an HTTP callback target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::cron::{CronError, CronExpr};
use super::types::JobId;

/// Errors that can occur when creating or updating a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The cron schedule does not parse or can never fire.
    #[error(transparent)]
    InvalidSchedule(#[from] CronError),

    /// The callback target is not an absolute http(s) URL.
    #[error("invalid target url '{url}': {reason}")]
    InvalidTargetUrl { url: String, reason: String },
}

/// Delivery semantics for a job's occurrences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// Failed attempts are retried with backoff; duplicates are possible.
    #[default]
    AtLeastOnce,
    /// A single attempt per occurrence, successful or not.
    AtMostOnce,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::AtLeastOnce => "AT_LEAST_ONCE",
            ExecutionType::AtMostOnce => "AT_MOST_ONCE",
        }
    }
}

impl std::str::FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AT_LEAST_ONCE" => Ok(ExecutionType::AtLeastOnce),
            "AT_MOST_ONCE" => Ok(ExecutionType::AtMostOnce),
            other => Err(format!("unknown execution type: {}", other)),
        }
    }
}

impl std::fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled job.
///
/// `job_id` is immutable for the lifetime of the job; `schedule`,
/// `target_url`, and `active` may be changed through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// Six-field cron expression with seconds, evaluated in UTC.
    pub schedule: String,
    /// Absolute http(s) URL the scheduler POSTs to.
    pub target_url: String,
    pub execution_type: ExecutionType,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new active job, validating the schedule and target URL.
    pub fn new(
        schedule: impl Into<String>,
        target_url: impl Into<String>,
        execution_type: ExecutionType,
    ) -> Result<Self, JobError> {
        let schedule = schedule.into();
        let target_url = target_url.into();

        CronExpr::parse(&schedule)?;
        validate_target_url(&target_url)?;

        let now = Utc::now();
        Ok(Self {
            job_id: JobId::new(),
            schedule,
            target_url,
            execution_type,
            active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Parse this job's schedule.
    pub fn cron(&self) -> Result<CronExpr, CronError> {
        CronExpr::parse(&self.schedule)
    }
}

/// Partial update applied to an existing job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobUpdate {
    pub schedule: Option<String>,
    pub target_url: Option<String>,
    pub active: Option<bool>,
}

impl JobUpdate {
    /// Validate the fields that are present.
    pub fn validate(&self) -> Result<(), JobError> {
        if let Some(schedule) = &self.schedule {
            CronExpr::parse(schedule)?;
        }
        if let Some(url) = &self.target_url {
            validate_target_url(url)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.is_none() && self.target_url.is_none() && self.active.is_none()
    }
}

/// Check that a callback target is an absolute http or https URL.
pub fn validate_target_url(url: &str) -> Result<(), JobError> {
    let parsed = Url::parse(url).map_err(|e| JobError::InvalidTargetUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(JobError::InvalidTargetUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}
