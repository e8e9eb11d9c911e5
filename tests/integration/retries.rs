//! Retry state machine: failed attempts close as RETRYING, retries land
//! with exponential backoff, and exhaustion ends the occurrence as FAILED
//! without stopping the cadence.

use chime::{ExecutionStatus, ExecutionType, Job, JobStore, MemoryStore};
use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{start_scheduler, test_config, wait_for_executions};

#[tokio::test]
async fn test_retry_then_success() {
    let server = MockServer::start().await;
    // First two attempts get a 500, everything after succeeds.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("flaky"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    // Fire once at a second a couple of ticks from now; the next cron
    // occurrence is a minute out, far beyond the test window.
    let fire_second = (Utc::now() + chrono::Duration::seconds(2)).second();
    let schedule = format!("{} * * * * *", fire_second);
    let job = Job::new(schedule, server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    let success = wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Success,
        1,
        Duration::from_secs(15),
    )
    .await;
    assert_eq!(success[0].attempt, 3);

    let retrying = wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Retrying,
        2,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(retrying[0].attempt, 1);
    assert_eq!(retrying[1].attempt, 2);
    assert_eq!(retrying[0].http_status, Some(500));
    assert!(retrying[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("HTTP 500"));

    // All three attempts belong to the same occurrence.
    assert_eq!(retrying[0].scheduled_time, success[0].scheduled_time);
    assert_eq!(retrying[1].scheduled_time, success[0].scheduled_time);

    // Backoff gaps: ~1s (jittered to [0.5, 1.0]) then ~2s ([1.0, 2.0]),
    // plus scheduler latency.
    let start1 = retrying[0].actual_start_time.unwrap();
    let start2 = retrying[1].actual_start_time.unwrap();
    let start3 = success[0].actual_start_time.unwrap();
    let gap1 = (start2 - start1).num_milliseconds();
    let gap2 = (start3 - start2).num_milliseconds();
    assert!((400..2000).contains(&gap1), "first backoff gap {}ms", gap1);
    assert!((900..3500).contains(&gap2), "second backoff gap {}ms", gap2);

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_retries_exhausted_ends_failed_and_cadence_continues() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let job = Job::new("*/4 * * * * *", server.uri(), ExecutionType::AtLeastOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let mut config = test_config();
    config.max_retries = 1; // two attempts per occurrence

    let (handle, task) = start_scheduler(Arc::clone(&store), config);

    // Two occurrences, each ending FAILED after a RETRYING attempt.
    let failed = wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Failed,
        2,
        Duration::from_secs(15),
    )
    .await;

    for execution in &failed {
        assert_eq!(execution.attempt, 2);
        assert_eq!(execution.http_status, Some(500));
    }

    let retrying = wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Retrying,
        2,
        Duration::from_secs(2),
    )
    .await;
    for execution in &retrying {
        assert_eq!(execution.attempt, 1);
    }

    // The failure did not stall the schedule: the occurrences are distinct
    // cron ticks, four seconds apart.
    let gap = (failed[1].scheduled_time - failed[0].scheduled_time).num_seconds();
    assert_eq!(gap, 4, "next occurrence was not planned after failure");

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_at_most_once_never_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let job = Job::new("* * * * * *", server.uri(), ExecutionType::AtMostOnce).unwrap();
    let job_id = job.job_id;
    store.create_job(job).await.unwrap();

    let (handle, task) = start_scheduler(Arc::clone(&store), test_config());

    let failed = wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Failed,
        2,
        Duration::from_secs(10),
    )
    .await;

    // One row per occurrence, all first attempts, none retried.
    for execution in &failed {
        assert_eq!(execution.attempt, 1);
    }
    let all = store.list_executions(&job_id, 100).await.unwrap();
    assert!(all
        .iter()
        .all(|e| e.status != ExecutionStatus::Retrying));

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}
