//! Common test utilities shared across integration tests.

use chime::{
    Execution, ExecutionStatus, JobId, JobStore, MemoryStore, Scheduler, SchedulerConfig,
    SchedulerHandle,
};
use std::sync::Arc;
use std::time::Duration;

/// A scheduler config tuned for fast tests: small pool, short timeouts,
/// and a refresh interval long enough that reconciliation only happens
/// through explicit `reload_jobs` calls.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        max_workers: 4,
        request_timeout: Duration::from_secs(5),
        max_retries: 3,
        refresh_interval: Duration::from_secs(3600),
        backoff_cap_seconds: 64,
        response_capture_bytes: 4096,
    }
}

/// Start a scheduler over shared in-memory storage.
pub fn start_scheduler(
    store: Arc<MemoryStore>,
    config: SchedulerConfig,
) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
    Scheduler::with_store(store, config)
        .start()
        .expect("scheduler failed to start")
}

/// Poll storage until a job has at least `count` executions with the given
/// status, returning them oldest first.
///
/// More reliable than fixed sleeps since execution timing can vary.
///
/// # Panics
///
/// Panics if the timeout elapses first.
pub async fn wait_for_executions(
    store: &dyn JobStore,
    job_id: &JobId,
    status: ExecutionStatus,
    count: usize,
    timeout: Duration,
) -> Vec<Execution> {
    let start = tokio::time::Instant::now();
    loop {
        let rows = store.list_executions(job_id, 100).await.unwrap();
        let mut matching: Vec<Execution> =
            rows.into_iter().filter(|e| e.status == status).collect();
        if matching.len() >= count {
            matching.reverse(); // list is newest first
            return matching;
        }
        if start.elapsed() > timeout {
            panic!(
                "timeout waiting for {} {:?} executions for job {}, have {}",
                count,
                status,
                job_id,
                matching.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll storage until one execution reaches the expected status.
pub async fn wait_for_execution_status(
    store: &dyn JobStore,
    execution_id: &chime::ExecutionId,
    expected: ExecutionStatus,
    timeout: Duration,
) -> Execution {
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(execution) = store.get_execution(execution_id).await {
            if execution.status == expected {
                return execution;
            }
        }
        if start.elapsed() > timeout {
            panic!(
                "timeout waiting for execution {} to reach {:?}",
                execution_id, expected
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
