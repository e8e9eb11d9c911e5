//! Scheduler engine implementation.
//!
//! Single-owner control flow: one task owns the due queue, the set of
//! tracked jobs, and every execution-status write besides the worker's
//! PENDING -> RUNNING transition. Wake sources are the earliest queue
//! entry, the refresh tick, control commands, and worker outcomes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::handle::{SchedulerCommand, SchedulerHandle};
use super::{SchedulerConfig, SchedulerError, SchedulerState};
use crate::core::{
    BackoffPolicy, CronError, CronExpr, Execution, ExecutionId, ExecutionStatus, ExecutionType,
    Job, JobId, TerminalUpdate,
};
use crate::queue::{DueQueue, QueueEntry};
use crate::store::{JobStore, StoreError};
use crate::worker::{AttemptOutcome, AttemptTask, PoolSaturated, WorkerPool};

/// Buffer size for the command channel between handle and scheduler.
const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Buffer size for the worker outcome channel.
const OUTCOME_CHANNEL_BUFFER: usize = 256;

/// Re-enqueue delay when the worker pool refuses a dispatch.
const SATURATION_RETRY_MS: i64 = 100;

/// Backoff ladder for transient store-write failures. After the ladder is
/// exhausted the scheduler degrades to logging and moves on.
const STORE_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(300),
    Duration::from_millis(900),
];

/// Accelerated refresh after a transient failure never drops below this.
const REFRESH_FLOOR: Duration = Duration::from_secs(5);

/// Extra grace past the request timeout when draining on shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// What the scheduler remembers about an active job between refreshes.
struct JobSnapshot {
    schedule: String,
    cron: CronExpr,
    target_url: String,
    execution_type: ExecutionType,
}

/// Metadata for an attempt currently at the worker pool.
struct InFlightAttempt {
    entry: QueueEntry,
    /// Ad-hoc occurrences never advance the cron cadence.
    ad_hoc: bool,
}

/// Main scheduler for cron-driven HTTP callbacks.
pub struct Scheduler<S> {
    store: Arc<S>,
    config: SchedulerConfig,
}

impl<S: JobStore + 'static> Scheduler<S> {
    /// Create a new scheduler over the given store.
    pub fn new(store: S, config: SchedulerConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
        }
    }

    /// Create a scheduler with shared store access (useful for testing and
    /// for the API layer, which reads through the same store).
    pub fn with_store(store: Arc<S>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Start the scheduler and return a handle for controlling it.
    pub fn start(self) -> Result<(SchedulerHandle, JoinHandle<()>), SchedulerError> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let pool = WorkerPool::new(
            self.config.max_workers,
            self.config.response_capture_bytes,
            Arc::clone(&self.store) as Arc<dyn JobStore>,
            outcome_tx,
        )
        .map_err(|e| SchedulerError::HttpClient(e.to_string()))?;

        let engine = Engine {
            store: self.store,
            pool,
            backoff: BackoffPolicy::new(self.config.backoff_cap_seconds),
            config: self.config,
            queue: DueQueue::new(),
            jobs: HashMap::new(),
            in_flight: HashMap::new(),
        };

        let handle = SchedulerHandle::new(command_tx, Arc::clone(&state));
        let task = tokio::spawn(async move {
            engine.run(command_rx, outcome_rx, state).await;
        });

        Ok((handle, task))
    }
}

struct Engine<S> {
    store: Arc<S>,
    pool: WorkerPool,
    backoff: BackoffPolicy,
    config: SchedulerConfig,
    queue: DueQueue,
    jobs: HashMap<JobId, JobSnapshot>,
    in_flight: HashMap<ExecutionId, InFlightAttempt>,
}

impl<S: JobStore> Engine<S> {
    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        mut outcome_rx: mpsc::Receiver<AttemptOutcome>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        self.sweep_interrupted().await;
        self.refresh_jobs().await;
        tracing::info!(jobs = self.jobs.len(), "scheduler started");

        let mut refresh_every = self.config.refresh_interval;
        let mut refresh = tokio::time::interval_at(
            tokio::time::Instant::now() + refresh_every,
            refresh_every,
        );
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_due = self.queue.next_due_at();

            tokio::select! {
                _ = sleep_until_due(next_due) => {
                    self.dispatch_due().await;
                }

                _ = refresh.tick() => {
                    let ok = self.refresh_jobs().await;
                    // Accelerate after a transient failure, restore on success.
                    let want = if ok {
                        self.config.refresh_interval
                    } else {
                        (refresh_every / 2).max(REFRESH_FLOOR)
                    };
                    if want != refresh_every {
                        refresh_every = want;
                        refresh = tokio::time::interval_at(
                            tokio::time::Instant::now() + refresh_every,
                            refresh_every,
                        );
                        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(SchedulerCommand::ReloadJobs { reply }) => {
                            self.refresh_jobs().await;
                            let _ = reply.send(());
                        }
                        Some(SchedulerCommand::DispatchNow { job_id, reply }) => {
                            let result = self.dispatch_now(job_id).await;
                            let _ = reply.send(result);
                        }
                        Some(SchedulerCommand::SetJobActive { job_id, active, reply }) => {
                            let result = self.set_job_active(job_id, active).await;
                            let _ = reply.send(result);
                        }
                        Some(SchedulerCommand::Shutdown { drain, reply }) => {
                            *state.write().await = SchedulerState::Stopped;
                            self.shutdown(drain, &mut outcome_rx).await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            // All handles dropped; stop without draining.
                            *state.write().await = SchedulerState::Stopped;
                            self.shutdown(false, &mut outcome_rx).await;
                            break;
                        }
                    }
                }

                Some(outcome) = outcome_rx.recv() => {
                    self.handle_outcome(outcome).await;
                }
            }
        }

        tracing::info!("scheduler stopped");
    }

    /// Mark executions abandoned by a previous process as failed.
    ///
    /// A crash mid-flight leaves PENDING or RUNNING rows; on start-up they
    /// can no longer complete, so they are closed out for auditability.
    async fn sweep_interrupted(&self) {
        match self.store.list_incomplete_executions().await {
            Ok(rows) => {
                for execution in rows {
                    tracing::info!(
                        execution_id = %execution.execution_id,
                        job_id = %execution.job_id,
                        "sweeping interrupted execution"
                    );
                    self.write_terminal(
                        &execution.execution_id,
                        TerminalUpdate::failed(None, None, "interrupted"),
                    )
                    .await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to sweep interrupted executions");
            }
        }
    }

    /// Reconcile tracked jobs and the queue with the store.
    ///
    /// Returns false on a transient store failure so the caller can
    /// accelerate the next refresh.
    async fn refresh_jobs(&mut self) -> bool {
        let active_jobs = match self.store.list_active_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "job refresh failed");
                return false;
            }
        };

        let now = Utc::now();
        let fresh: HashMap<JobId, Job> = active_jobs
            .into_iter()
            .map(|job| (job.job_id, job))
            .collect();

        // Jobs that disappeared or went inactive: drop the queue entry,
        // let in-flight attempts complete.
        let gone: Vec<JobId> = self
            .jobs
            .keys()
            .filter(|job_id| !fresh.contains_key(job_id))
            .copied()
            .collect();
        for job_id in gone {
            tracing::info!(job_id = %job_id, "job deactivated, removing from schedule");
            self.jobs.remove(&job_id);
            self.queue.remove(&job_id);
        }

        for (job_id, job) in fresh {
            enum Plan {
                Unchanged,
                Reschedule,
                New,
            }
            let plan = match self.jobs.get(&job_id) {
                Some(snapshot) if snapshot.schedule == job.schedule => Plan::Unchanged,
                Some(_) => Plan::Reschedule,
                None => Plan::New,
            };

            match plan {
                Plan::Unchanged => {
                    if let Some(snapshot) = self.jobs.get_mut(&job_id) {
                        // URL and semantics edits take effect without
                        // disturbing the cadence.
                        snapshot.target_url = job.target_url;
                        snapshot.execution_type = job.execution_type;
                    }
                    // Re-seed a job that fell out of the queue entirely,
                    // e.g. after a previously unschedulable horizon.
                    let job_busy = self.queue.contains(&job_id)
                        || self.in_flight.values().any(|a| a.entry.job_id == job_id);
                    if !job_busy {
                        if let Some(snapshot) = self.jobs.get(&job_id) {
                            match snapshot.cron.next_after(now) {
                                Ok(next) => {
                                    self.queue.push(QueueEntry::occurrence(job_id, next))
                                }
                                Err(e) => tracing::warn!(
                                    job_id = %job_id,
                                    error = %e,
                                    "job has no upcoming occurrence"
                                ),
                            }
                        }
                    }
                }
                Plan::Reschedule => {
                    tracing::info!(
                        job_id = %job_id,
                        schedule = %job.schedule,
                        "schedule changed, rescheduling from now"
                    );
                    self.queue.remove(&job_id);
                    self.track_job(job, now);
                }
                Plan::New => {
                    tracing::info!(job_id = %job_id, schedule = %job.schedule, "scheduling job");
                    self.track_job(job, now);
                }
            }
        }

        true
    }

    /// Start tracking a job and enqueue its first occurrence after `now`.
    fn track_job(&mut self, job: Job, now: DateTime<Utc>) {
        let cron = match job.cron() {
            Ok(cron) => cron,
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "job has invalid schedule, skipping");
                return;
            }
        };

        match cron.next_after(now) {
            Ok(next) => {
                self.queue.push(QueueEntry::occurrence(job.job_id, next));
                self.jobs.insert(
                    job.job_id,
                    JobSnapshot {
                        schedule: job.schedule,
                        cron,
                        target_url: job.target_url,
                        execution_type: job.execution_type,
                    },
                );
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "job is unschedulable, skipping");
            }
        }
    }

    /// Pop and dispatch everything that has come due.
    async fn dispatch_due(&mut self) {
        let now = Utc::now();
        while let Some(entry) = self.queue.pop_if_due(now) {
            self.dispatch_entry(entry).await;
        }
    }

    async fn dispatch_entry(&mut self, entry: QueueEntry) {
        let Some(snapshot) = self.jobs.get(&entry.job_id) else {
            // Deactivated between enqueue and pop.
            tracing::debug!(job_id = %entry.job_id, "dropping entry for untracked job");
            return;
        };
        let target_url = snapshot.target_url.clone();

        // Reserve capacity before writing the PENDING row so a refused
        // submission leaves no execution row behind.
        let slot = match self.pool.try_reserve() {
            Ok(slot) => slot,
            Err(PoolSaturated) => {
                tracing::warn!(job_id = %entry.job_id, "worker pool saturated, delaying dispatch");
                let mut delayed = entry;
                delayed.scheduled_for =
                    Utc::now() + chrono::Duration::milliseconds(SATURATION_RETRY_MS);
                self.queue.push(delayed);
                return;
            }
        };

        let execution =
            Execution::pending(entry.job_id, entry.origin_scheduled_for, entry.attempt);
        self.persist_pending(&execution).await;

        tracing::info!(
            job_id = %entry.job_id,
            execution_id = %execution.execution_id,
            attempt = entry.attempt,
            "dispatching to worker pool"
        );

        self.in_flight.insert(
            execution.execution_id,
            InFlightAttempt {
                entry,
                ad_hoc: false,
            },
        );

        let task = AttemptTask {
            execution_id: execution.execution_id,
            job_id: entry.job_id,
            target_url,
            attempt: entry.attempt,
            scheduled_for: entry.scheduled_for,
            origin_scheduled_for: entry.origin_scheduled_for,
            timeout: self.config.request_timeout,
        };
        self.pool.submit(slot, task).await;
    }

    /// Fire an ad-hoc occurrence with `scheduled_time = now`.
    ///
    /// Works for paused jobs too: manual dispatch is an operator action and
    /// does not consult the active flag. Ad-hoc occurrences are
    /// single-attempt and never advance the cron cadence.
    async fn dispatch_now(&mut self, job_id: JobId) -> Result<ExecutionId, SchedulerError> {
        let target_url = match self.jobs.get(&job_id) {
            Some(snapshot) => snapshot.target_url.clone(),
            None => match self.store.get_job(&job_id).await {
                Ok(job) => job.target_url,
                Err(StoreError::NotFound(_)) => {
                    return Err(SchedulerError::JobNotFound(job_id.to_string()))
                }
                Err(e) => return Err(e.into()),
            },
        };

        let slot = self
            .pool
            .try_reserve()
            .map_err(|_| SchedulerError::PoolSaturated)?;

        let now = Utc::now();
        let execution = Execution::pending(job_id, now, 1);
        self.persist_pending(&execution).await;

        tracing::info!(
            job_id = %job_id,
            execution_id = %execution.execution_id,
            "dispatching ad-hoc occurrence"
        );

        self.in_flight.insert(
            execution.execution_id,
            InFlightAttempt {
                entry: QueueEntry::occurrence(job_id, now),
                ad_hoc: true,
            },
        );

        let task = AttemptTask {
            execution_id: execution.execution_id,
            job_id,
            target_url,
            attempt: 1,
            scheduled_for: now,
            origin_scheduled_for: now,
            timeout: self.config.request_timeout,
        };
        self.pool.submit(slot, task).await;
        Ok(execution.execution_id)
    }

    async fn set_job_active(
        &mut self,
        job_id: JobId,
        active: bool,
    ) -> Result<(), SchedulerError> {
        self.store.set_job_active(&job_id, active).await?;
        self.refresh_jobs().await;
        Ok(())
    }

    /// Apply one worker outcome: terminal write, retry decision, cadence.
    async fn handle_outcome(&mut self, outcome: AttemptOutcome) {
        let execution_id = outcome.task.execution_id;
        let Some(in_flight) = self.in_flight.remove(&execution_id) else {
            tracing::warn!(execution_id = %execution_id, "outcome for untracked attempt");
            return;
        };

        if outcome.success {
            tracing::info!(
                job_id = %in_flight.entry.job_id,
                execution_id = %execution_id,
                attempt = in_flight.entry.attempt,
                duration_ms = outcome.duration_ms,
                "attempt succeeded"
            );
            self.write_terminal(
                &execution_id,
                TerminalUpdate {
                    status: ExecutionStatus::Success,
                    http_status: outcome.http_status,
                    duration_ms: Some(outcome.duration_ms),
                    finished_at: Utc::now(),
                    error_message: None,
                },
            )
            .await;
            self.plan_next_occurrence(&in_flight);
            return;
        }

        let error_message = outcome
            .error_message
            .clone()
            .unwrap_or_else(|| "request failed".to_string());

        let retryable = !in_flight.ad_hoc
            && self
                .jobs
                .get(&in_flight.entry.job_id)
                .map(|snapshot| snapshot.execution_type == ExecutionType::AtLeastOnce)
                .unwrap_or(false)
            && in_flight.entry.attempt < self.config.max_retries + 1;

        if retryable {
            let delay = self.backoff.delay(in_flight.entry.attempt);
            tracing::warn!(
                job_id = %in_flight.entry.job_id,
                execution_id = %execution_id,
                attempt = in_flight.entry.attempt,
                error = %error_message,
                retry_in_ms = delay.as_millis() as u64,
                "attempt failed, scheduling retry"
            );
            self.write_terminal(
                &execution_id,
                TerminalUpdate {
                    status: ExecutionStatus::Retrying,
                    http_status: outcome.http_status,
                    duration_ms: Some(outcome.duration_ms),
                    finished_at: Utc::now(),
                    error_message: Some(error_message),
                },
            )
            .await;

            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));
            self.queue.push(in_flight.entry.retry(retry_at));
        } else {
            tracing::error!(
                job_id = %in_flight.entry.job_id,
                execution_id = %execution_id,
                attempt = in_flight.entry.attempt,
                error = %error_message,
                "attempt failed terminally"
            );
            self.write_terminal(
                &execution_id,
                TerminalUpdate {
                    status: ExecutionStatus::Failed,
                    http_status: outcome.http_status,
                    duration_ms: Some(outcome.duration_ms),
                    finished_at: Utc::now(),
                    error_message: Some(error_message),
                },
            )
            .await;
            self.plan_next_occurrence(&in_flight);
        }
    }

    /// Enqueue the occurrence after the one that just finished.
    ///
    /// Planning advances from the occurrence origin, not from now, so the
    /// cadence stays drift-free; catch-up after a gap fires only the most
    /// recent missed occurrence.
    fn plan_next_occurrence(&mut self, in_flight: &InFlightAttempt) {
        if in_flight.ad_hoc {
            return;
        }
        let Some(snapshot) = self.jobs.get(&in_flight.entry.job_id) else {
            // Deactivated while the attempt was in flight.
            return;
        };

        match next_occurrence_after(&snapshot.cron, in_flight.entry.origin_scheduled_for, Utc::now()) {
            Ok(next) => {
                tracing::debug!(job_id = %in_flight.entry.job_id, next = %next, "next occurrence planned");
                self.queue
                    .push(QueueEntry::occurrence(in_flight.entry.job_id, next));
            }
            Err(e) => {
                tracing::error!(
                    job_id = %in_flight.entry.job_id,
                    error = %e,
                    "cannot plan next occurrence, leaving job unscheduled"
                );
            }
        }
    }

    /// Write a fresh PENDING row, retrying transient store failures.
    ///
    /// On exhaustion the dispatch proceeds anyway: at-least-once favours
    /// executing over recording, and a missing row is the documented
    /// degradation when the store stays down.
    async fn persist_pending(&self, execution: &Execution) {
        let result =
            retry_transient("execution insert", || self.store.upsert_execution(execution)).await;
        if let Err(e) = result {
            tracing::error!(
                execution_id = %execution.execution_id,
                error = %e,
                "giving up persisting execution row"
            );
        }
    }

    /// Write an attempt's final state, retrying transient store failures.
    async fn write_terminal(&self, execution_id: &ExecutionId, update: TerminalUpdate) {
        let result = retry_transient("execution update", || {
            self.store.update_execution_terminal(execution_id, update.clone())
        })
        .await;

        match result {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    "terminal status already written, skipping"
                );
            }
            Err(e) => {
                tracing::error!(
                    execution_id = %execution_id,
                    error = %e,
                    "giving up terminal execution write"
                );
            }
        }
    }

    /// Stop: optionally drain in-flight attempts, then cancel stragglers
    /// and record them as failed.
    async fn shutdown(&mut self, drain: bool, outcome_rx: &mut mpsc::Receiver<AttemptOutcome>) {
        tracing::info!(drain, in_flight = self.in_flight.len(), "scheduler stopping");

        if drain {
            let deadline =
                tokio::time::Instant::now() + self.config.request_timeout + DRAIN_GRACE;
            while !self.in_flight.is_empty() {
                match tokio::time::timeout_at(deadline, outcome_rx.recv()).await {
                    Ok(Some(outcome)) => self.handle_outcome(outcome).await,
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(
                            remaining = self.in_flight.len(),
                            "drain deadline reached, cancelling remaining attempts"
                        );
                        break;
                    }
                }
            }
        }

        self.pool.shutdown(false).await;

        let cancelled: Vec<ExecutionId> = self.in_flight.keys().copied().collect();
        for execution_id in cancelled {
            self.in_flight.remove(&execution_id);
            self.write_terminal(&execution_id, TerminalUpdate::failed(None, None, "cancelled"))
                .await;
        }
    }
}

/// Sleep until the earliest queue entry is due; pend forever when empty.
async fn sleep_until_due(next_due: Option<DateTime<Utc>>) {
    match next_due {
        Some(at) => {
            let delta = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(delta).await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// The occurrence to fire after `origin`, catching up after gaps.
///
/// When `now` has passed several occurrences, only the most recent missed
/// one is returned (it fires immediately); anything older is skipped.
fn next_occurrence_after(
    cron: &CronExpr,
    origin: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let mut next = cron.next_after(origin)?;
    if next > now {
        return Ok(next);
    }
    loop {
        let following = cron.next_after(next)?;
        if following > now {
            return Ok(next);
        }
        next = following;
    }
}

/// Run a store write, retrying transient failures on a fixed ladder.
async fn retry_transient<T, F, Fut>(what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut result = op().await;
    for delay in STORE_RETRY_DELAYS {
        match result {
            Err(ref e) if e.is_transient() => {
                tracing::warn!(error = %e, "transient store failure during {}, retrying", what);
                tokio::time::sleep(delay).await;
                result = op().await;
            }
            other => return other,
        }
    }
    result
}
