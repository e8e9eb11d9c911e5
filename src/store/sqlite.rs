//! SQLite store implementation.
//!
//! Provides persistent storage using SQLite with automatic schema
//! migration on connect.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use super::{JobStore, StoreError};
use crate::core::{
    Execution, ExecutionId, ExecutionStatus, ExecutionType, Job, JobId, JobUpdate, TerminalUpdate,
};

/// SQLite store backend.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect using a `sqlite:` URL or a bare file path, creating the
    /// database file if missing and applying migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite:{}", database_url)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| StoreError::Transient(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Transient(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Transient(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// Timestamps are stored as fixed-width RFC 3339 text so lexicographic
// ordering in SQL matches chronological ordering.
fn datetime_to_string(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Transient(format!("bad timestamp '{}': {}", text, e)))
}

fn sql_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
        other => StoreError::Transient(other.to_string()),
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let job_id: String = row.try_get("job_id").map_err(sql_error)?;
    let execution_type: String = row.try_get("execution_type").map_err(sql_error)?;
    let created_at: String = row.try_get("created_at").map_err(sql_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(sql_error)?;

    Ok(Job {
        job_id: job_id
            .parse()
            .map_err(|e| StoreError::Transient(format!("bad job_id: {}", e)))?,
        schedule: row.try_get("schedule").map_err(sql_error)?,
        target_url: row.try_get("target_url").map_err(sql_error)?,
        execution_type: ExecutionType::from_str(&execution_type).map_err(StoreError::Transient)?,
        active: row.try_get::<i64, _>("active").map_err(sql_error)? != 0,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<Execution, StoreError> {
    let execution_id: String = row.try_get("execution_id").map_err(sql_error)?;
    let job_id: String = row.try_get("job_id").map_err(sql_error)?;
    let scheduled_time: String = row.try_get("scheduled_time").map_err(sql_error)?;
    let actual_start_time: Option<String> = row.try_get("actual_start_time").map_err(sql_error)?;
    let finished_at: Option<String> = row.try_get("finished_at").map_err(sql_error)?;
    let status: String = row.try_get("status").map_err(sql_error)?;
    let created_at: String = row.try_get("created_at").map_err(sql_error)?;

    Ok(Execution {
        execution_id: execution_id
            .parse()
            .map_err(|e| StoreError::Transient(format!("bad execution_id: {}", e)))?,
        job_id: job_id
            .parse()
            .map_err(|e| StoreError::Transient(format!("bad job_id: {}", e)))?,
        scheduled_time: parse_datetime(&scheduled_time)?,
        actual_start_time: actual_start_time.as_deref().map(parse_datetime).transpose()?,
        finished_at: finished_at.as_deref().map(parse_datetime).transpose()?,
        status: ExecutionStatus::from_str(&status).map_err(StoreError::Transient)?,
        http_status: row
            .try_get::<Option<i64>, _>("http_status")
            .map_err(sql_error)?
            .map(|code| code as u16),
        duration_ms: row.try_get("duration_ms").map_err(sql_error)?,
        attempt: row.try_get::<i64, _>("attempt").map_err(sql_error)? as u32,
        error_message: row.try_get("error_message").map_err(sql_error)?,
        created_at: parse_datetime(&created_at)?,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (job_id, schedule, target_url, execution_type, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.job_id.to_string())
        .bind(&job.schedule)
        .bind(&job.target_url)
        .bind(job.execution_type.as_str())
        .bind(job.active as i64)
        .bind(datetime_to_string(job.created_at))
        .bind(datetime_to_string(job.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(format!("job: {}", job.job_id)))
            }
            Err(e) => Err(sql_error(e)),
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))?;
        job_from_row(&row)
    }

    async fn list_jobs(&self, active: Option<bool>) -> Result<Vec<Job>, StoreError> {
        let rows = match active {
            Some(want) => {
                sqlx::query("SELECT * FROM jobs WHERE active = ? ORDER BY created_at DESC")
                    .bind(want as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(sql_error)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.list_jobs(Some(true)).await
    }

    async fn update_job(&self, id: &JobId, update: JobUpdate) -> Result<Job, StoreError> {
        let mut job = self.get_job(id).await?;

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

        sqlx::query(
            "UPDATE jobs SET schedule = ?, target_url = ?, active = ?, updated_at = ?
             WHERE job_id = ?",
        )
        .bind(&job.schedule)
        .bind(&job.target_url)
        .bind(job.active as i64)
        .bind(datetime_to_string(job.updated_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sql_error)?;

        Ok(job)
    }

    async fn set_job_active(&self, id: &JobId, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET active = ?, updated_at = ? WHERE job_id = ?")
            .bind(active as i64)
            .bind(datetime_to_string(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO job_executions
             (execution_id, job_id, scheduled_time, actual_start_time, finished_at,
              status, http_status, duration_ms, attempt, error_message, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution.execution_id.to_string())
        .bind(execution.job_id.to_string())
        .bind(datetime_to_string(execution.scheduled_time))
        .bind(execution.actual_start_time.map(datetime_to_string))
        .bind(execution.finished_at.map(datetime_to_string))
        .bind(execution.status.as_str())
        .bind(execution.http_status.map(|code| code as i64))
        .bind(execution.duration_ms)
        .bind(execution.attempt as i64)
        .bind(&execution.error_message)
        .bind(datetime_to_string(execution.created_at))
        .execute(&self.pool)
        .await
        .map_err(sql_error)?;
        Ok(())
    }

    async fn record_attempt_start(
        &self,
        id: &ExecutionId,
        actual_start_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE job_executions SET status = 'RUNNING', actual_start_time = ?
             WHERE execution_id = ? AND status = 'PENDING'",
        )
        .bind(datetime_to_string(actual_start_time))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sql_error)?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from a row in the wrong state.
            let execution = self.get_execution(id).await?;
            return Err(StoreError::Conflict(format!(
                "execution {} is {}, expected PENDING",
                id, execution.status
            )));
        }
        Ok(())
    }

    async fn update_execution_terminal(
        &self,
        id: &ExecutionId,
        update: TerminalUpdate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE job_executions
             SET status = ?, http_status = ?, duration_ms = ?, finished_at = ?, error_message = ?
             WHERE execution_id = ? AND status NOT IN ('SUCCESS', 'FAILED')",
        )
        .bind(update.status.as_str())
        .bind(update.http_status.map(|code| code as i64))
        .bind(update.duration_ms)
        .bind(datetime_to_string(update.finished_at))
        .bind(&update.error_message)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sql_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Row exists but is already terminal, or does not exist at all.
        self.get_execution(id).await?;
        Ok(false)
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Execution, StoreError> {
        let row = sqlx::query("SELECT * FROM job_executions WHERE execution_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?
            .ok_or_else(|| StoreError::NotFound(format!("execution: {}", id)))?;
        execution_from_row(&row)
    }

    async fn list_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM job_executions WHERE job_id = ?
             ORDER BY created_at DESC, attempt DESC LIMIT ?",
        )
        .bind(job_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error)?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn list_incomplete_executions(&self) -> Result<Vec<Execution>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM job_executions WHERE status IN ('PENDING', 'RUNNING')")
                .fetch_all(&self.pool)
                .await
                .map_err(sql_error)?;

        rows.iter().map(execution_from_row).collect()
    }
}
