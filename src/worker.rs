//! Bounded worker pool for HTTP delivery attempts.
//!
//! Each submitted task performs exactly one `POST` against the job's
//! target URL; retry decisions live in the scheduler. Outcomes flow back
//! to the scheduler over an mpsc channel, which is the only back-edge
//! between the pool and the scheduling loop.

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::core::{ExecutionId, JobId};
use crate::store::JobStore;

/// Outstanding tasks allowed per worker before `try_reserve` refuses.
const BACKLOG_PER_WORKER: usize = 4;

/// The pool cannot take more work right now.
#[derive(Debug, Error)]
#[error("worker pool saturated")]
pub struct PoolSaturated;

/// One delivery attempt handed to the pool.
#[derive(Debug, Clone)]
pub struct AttemptTask {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub target_url: String,
    /// 1-based attempt number within the occurrence.
    pub attempt: u32,
    /// When the queue entry came due (backoff target for retries).
    pub scheduled_for: DateTime<Utc>,
    /// The occurrence origin reported to the callback target.
    pub origin_scheduled_for: DateTime<Utc>,
    pub timeout: Duration,
}

/// Failure classification for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    Timeout,
    ConnectionRefused,
    Dns,
    Tls,
    BadStatus,
    Other,
}

/// Structured result of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub task: AttemptTask,
    pub success: bool,
    pub http_status: Option<u16>,
    pub duration_ms: i64,
    pub error_kind: ErrorKind,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A reserved backlog slot, held until the attempt finishes.
///
/// Reserving before the execution row is written keeps the dispatch
/// ordering `persist PENDING -> submit` without ever creating a row for a
/// refused submission.
pub struct WorkerSlot {
    permit: OwnedSemaphorePermit,
}

/// Pool of HTTP executors with bounded concurrency and backlog.
pub struct WorkerPool {
    client: reqwest::Client,
    store: Arc<dyn JobStore>,
    workers: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    outcome_tx: mpsc::Sender<AttemptOutcome>,
    in_flight: Arc<RwLock<HashMap<ExecutionId, JoinHandle<()>>>>,
    capture_bytes: usize,
}

impl WorkerPool {
    /// Create a pool with `max_workers` concurrent attempts.
    pub fn new(
        max_workers: usize,
        capture_bytes: usize,
        store: Arc<dyn JobStore>,
        outcome_tx: mpsc::Sender<AttemptOutcome>,
    ) -> Result<Self, reqwest::Error> {
        // 3xx responses are reported as failures, never followed.
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            store,
            workers: Arc::new(Semaphore::new(max_workers)),
            backlog: Arc::new(Semaphore::new(max_workers * BACKLOG_PER_WORKER)),
            outcome_tx,
            in_flight: Arc::new(RwLock::new(HashMap::new())),
            capture_bytes,
        })
    }

    /// Reserve a backlog slot without blocking.
    pub fn try_reserve(&self) -> Result<WorkerSlot, PoolSaturated> {
        Arc::clone(&self.backlog)
            .try_acquire_owned()
            .map(|permit| WorkerSlot { permit })
            .map_err(|_| PoolSaturated)
    }

    /// Spawn the attempt for a reserved slot.
    pub async fn submit(&self, slot: WorkerSlot, task: AttemptTask) {
        let client = self.client.clone();
        let store = Arc::clone(&self.store);
        let workers = Arc::clone(&self.workers);
        let outcome_tx = self.outcome_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let capture_bytes = self.capture_bytes;
        let execution_id = task.execution_id;

        let handle = tokio::spawn(async move {
            let _slot = slot.permit;
            let Ok(_worker) = workers.acquire_owned().await else {
                return;
            };

            let started_at = Utc::now();
            if let Err(e) = store.record_attempt_start(&task.execution_id, started_at).await {
                tracing::warn!(
                    execution_id = %task.execution_id,
                    error = %e,
                    "failed to record attempt start"
                );
            }

            let outcome = perform_attempt(&client, task, started_at, capture_bytes).await;
            let _ = outcome_tx.send(outcome).await;

            in_flight.write().await.remove(&execution_id);
        });

        self.in_flight.write().await.insert(execution_id, handle);
    }

    /// Number of attempts currently spawned and not yet finished.
    pub async fn active_count(&self) -> usize {
        let mut in_flight = self.in_flight.write().await;
        in_flight.retain(|_, handle| !handle.is_finished());
        in_flight.len()
    }

    /// Stop the pool: wait for in-flight attempts (`drain = true`) or
    /// abort them (`drain = false`). Aborted attempts send no outcome; the
    /// scheduler records them as cancelled.
    pub async fn shutdown(&self, drain: bool) {
        if drain {
            loop {
                if self.active_count().await == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        } else {
            let mut in_flight = self.in_flight.write().await;
            for (_, handle) in in_flight.drain() {
                handle.abort();
            }
        }
    }
}

/// Perform the single HTTP attempt for a task.
async fn perform_attempt(
    client: &reqwest::Client,
    task: AttemptTask,
    started_at: DateTime<Utc>,
    capture_bytes: usize,
) -> AttemptOutcome {
    let body = serde_json::json!({
        "job_id": task.job_id,
        "execution_id": task.execution_id,
        "scheduled_time": task.origin_scheduled_for.to_rfc3339(),
        "actual_time": started_at.to_rfc3339(),
    });

    let clock = Instant::now();
    let result = client
        .post(&task.target_url)
        .header(CONTENT_TYPE, "application/json")
        .json(&body)
        .timeout(task.timeout)
        .send()
        .await;

    match result {
        Ok(response) => {
            let duration_ms = clock.elapsed().as_millis() as i64;
            let status = response.status();

            if status.is_success() {
                AttemptOutcome {
                    task,
                    success: true,
                    http_status: Some(status.as_u16()),
                    duration_ms,
                    error_kind: ErrorKind::None,
                    error_message: None,
                    started_at,
                }
            } else {
                let text = response.text().await.unwrap_or_default();
                let captured = truncate_capture(&text, capture_bytes);
                AttemptOutcome {
                    task,
                    success: false,
                    http_status: Some(status.as_u16()),
                    duration_ms,
                    error_kind: ErrorKind::BadStatus,
                    error_message: Some(format!("HTTP {}: {}", status.as_u16(), captured)),
                    started_at,
                }
            }
        }
        Err(e) => {
            let duration_ms = clock.elapsed().as_millis() as i64;
            let (error_kind, error_message) = classify_error(&e);
            AttemptOutcome {
                task,
                success: false,
                http_status: None,
                duration_ms,
                error_kind,
                error_message: Some(error_message),
                started_at,
            }
        }
    }
}

/// Map a reqwest error onto the pool's failure classification.
fn classify_error(e: &reqwest::Error) -> (ErrorKind, String) {
    let message = error_chain_message(e);

    if e.is_timeout() {
        return (ErrorKind::Timeout, message);
    }

    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return (ErrorKind::ConnectionRefused, message);
            }
        }
        let text = err.to_string().to_lowercase();
        if text.contains("dns") || text.contains("failed to lookup") {
            return (ErrorKind::Dns, message);
        }
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            return (ErrorKind::Tls, message);
        }
        source = err.source();
    }

    if e.is_connect() {
        (ErrorKind::ConnectionRefused, message)
    } else {
        (ErrorKind::Other, message)
    }
}

/// Flatten an error and its sources into one line.
fn error_chain_message(e: &reqwest::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

/// Truncate a captured response body to at most `max` bytes on a char
/// boundary.
fn truncate_capture(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
