//! Tick cadence: per-second schedules fire once per second and keep a
//! drift-free cadence derived from the occurrence origin.

use chime::{ExecutionStatus, ExecutionType, Job, JobStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{start_scheduler, test_config, wait_for_executions};

#[tokio::test]
async fn test_per_second_job_fires_every_second() {
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

    let successes = wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Success,
        3,
        Duration::from_secs(10),
    )
    .await;

    // Scheduled times are exactly one second apart, independent of any
    // execution latency.
    for pair in successes.windows(2) {
        let gap = pair[1].scheduled_time - pair[0].scheduled_time;
        assert_eq!(gap.num_seconds(), 1, "cadence drifted: {:?}", gap);
        assert_eq!(gap.num_milliseconds() % 1000, 0);
    }

    // Every attempt started at or after its scheduled time.
    for execution in &successes {
        let drift = execution.drift_ms().expect("started executions have drift");
        assert!(drift >= 0, "attempt started before schedule: {}ms", drift);
        assert_eq!(execution.attempt, 1);
        assert_eq!(execution.http_status, Some(200));
    }

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}

#[tokio::test]
async fn test_terminal_rows_are_never_rewritten() {
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

    let first = wait_for_executions(
        store.as_ref(),
        &job_id,
        ExecutionStatus::Success,
        1,
        Duration::from_secs(5),
    )
    .await;
    let execution_id = first[0].execution_id;

    // Give the scheduler time to process more occurrences, then check the
    // earlier row is untouched.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let row = store.get_execution(&execution_id).await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Success);
    assert_eq!(row.finished_at, first[0].finished_at);

    handle.shutdown(false).await.unwrap();
    let _ = task.await;
}
