//! Job lifecycle: deactivation, rescheduling, ad-hoc dispatch, recovery
//! of interrupted rows, and shutdown behaviour.

use chime::{ExecutionStatus, ExecutionType, Job, JobId, JobStore, JobUpdate, MemoryStore, SchedulerError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{
    start_scheduler, test_config, wait_for_execution_status, wait_for_executions,
};

/// A schedule that only fires on January 1st at midnight; effectively
/// never during a test run, so only ad-hoc dispatches produce rows.
const FAR_SCHEDULE: &str = "0 0 0 1 1 *";

#[tokio::test]
async fn test_deactivated_job_stops_firing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let job = Job::new("* * * * * *", server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Success,
        1,
        Duration::from_secs(5),
    )
    .await;

    handle.pause(job_id).await.unwrap();
    assert!(!store.get_job(&job_id).await.unwrap().active);

    // Let any already-dispatched attempt finish, then take a baseline.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let baseline = store.list_executions(&job_id, 100).await.unwrap().len();

    tokio::time::sleep(Duration::from_millis(1600)).await;
    let after = store.list_executions(&job_id, 100).await.unwrap().len();
    assert_eq!(after, baseline, "paused job still produced executions");

    // Resume: occurrences pick back up from now.
    handle.resume(job_id).await.unwrap();
    wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Success,
        baseline + 1,
        Duration::from_secs(5),
    )
    .await;

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_dispatch_now_fires_ad_hoc_occurrence() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let job = Job::new(FAR_SCHEDULE, server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    let before = Utc::now();
    let execution_id = handle.dispatch_now(job_id).await.unwrap();

    let execution = wait_for_execution_status(
        store.as_ref(),
        &execution_id,
        ExecutionStatus::Success,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(execution.attempt, 1);
    assert!(execution.scheduled_time >= before);
    assert!(execution.scheduled_time <= Utc::now());

    // The ad-hoc run did not spawn any cron occurrences.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.list_executions(&job_id, 100).await.unwrap().len(), 1);

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_dispatch_now_unknown_job() {
    let store = Arc::new(MemoryStore::new());
    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    let result = handle.dispatch_now(JobId::new()).await;
    assert!(matches!(result, Err(SchedulerError::JobNotFound(_))));

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_schedule_change_takes_effect_on_reload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let job = Job::new(FAR_SCHEDULE, server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    // Nothing fires on the far-future schedule.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(store.list_executions(&job_id, 10).await.unwrap().is_empty());

    store
        .update_job(
            &job_id,
            JobUpdate {
                schedule: Some("* * * * * *".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    handle.reload_jobs().await.unwrap();

    wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Success,
        2,
        Duration::from_secs(6),
    )
    .await;

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_invalid_stored_schedule_is_skipped_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());

    // A corrupt row written behind the API's back must not take the
    // scheduler down or block other jobs.
    let mut broken = Job::new("* * * * * *", server.uri(), ExecutionType::AtLeastOnce).unwrap();
    broken.schedule = "not a cron".to_string();
    store.create_job(broken.clone()).await.unwrap();

    let healthy = Job::new("* * * * * *", server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let healthy_id = healthy.job_id;
    store.create_job(healthy).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    wait_for_executions(
        store.as_ref(),
        &healthy_id,
        ExecutionStatus::Success,
        1,
        Duration::from_secs(5),
    )
    .await;
    assert!(store
        .list_executions(&broken.job_id, 10)
        .await
        .unwrap()
        .is_empty());

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_interrupted_rows_are_swept_on_startup() {
    let store = Arc::new(MemoryStore::new());

    // Simulate a crash: a PENDING row left behind by a previous process.
    let job = Job::new(FAR_SCHEDULE, "http://localhost:9/hook", ExecutionType::AtLeastOnce)
        .unwrap();
    let orphan = chime::Execution::pending(job.job_id, Utc::now(), 1);
    store.create_job(job).await.unwrap();
    store.upsert_execution(&orphan).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    let swept = wait_for_execution_status(
        store.as_ref(),
        &orphan.execution_id,
        ExecutionStatus::Failed,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(swept.error_message.as_deref(), Some("interrupted"));

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_shutdown_drain_records_in_flight_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let job = Job::new(FAR_SCHEDULE, server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    let execution_id = handle.dispatch_now(job_id).await.unwrap();
    handle.shutdown(true).await.unwrap();
    let _ = task.await;

    // The slow attempt completed and was recorded before exit.
    let execution = store.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_shutdown_without_drain_cancels_in_flight_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let job = Job::new(FAR_SCHEDULE, server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    let execution_id = handle.dispatch_now(job_id).await.unwrap();
    // Let the worker pick it up before pulling the plug.
    tokio::time::sleep(Duration::from_millis(200)).await;

    handle.shutdown(false).await.unwrap();
    let _ = task.await;

    let execution = store.get_execution(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_message.as_deref(), Some("cancelled"));
}
