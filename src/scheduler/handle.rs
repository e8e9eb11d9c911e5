//! Control handle for a running scheduler.
//!
//! The handle is the surface the CRUD adapter talks to: reload after job
//! mutations, ad-hoc dispatch, per-job pause/resume, and shutdown. Commands
//! travel over an mpsc channel and are serviced by the scheduler loop.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::{SchedulerError, SchedulerState};
use crate::core::{ExecutionId, JobId};

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Reconcile the queue with the store now.
    ReloadJobs { reply: oneshot::Sender<()> },
    /// Fire an ad-hoc occurrence immediately, bypassing the cron schedule.
    DispatchNow {
        job_id: JobId,
        reply: oneshot::Sender<Result<ExecutionId, SchedulerError>>,
    },
    /// Toggle a job's active flag in the store and reload.
    SetJobActive {
        job_id: JobId,
        active: bool,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// Stop the scheduler, optionally draining in-flight attempts.
    Shutdown { drain: bool, reply: oneshot::Sender<()> },
}

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    pub(crate) fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) -> Self {
        Self { command_tx, state }
    }

    /// Helper to send a command and wait for its reply.
    async fn send_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(reply_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        reply_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Trigger an immediate reconciliation with the store.
    pub async fn reload_jobs(&self) -> Result<(), SchedulerError> {
        self.send_command(|reply| SchedulerCommand::ReloadJobs { reply }, "reload")
            .await
    }

    /// Fire an ad-hoc occurrence of a job with `scheduled_time = now`,
    /// bypassing its cron expression.
    pub async fn dispatch_now(&self, job_id: JobId) -> Result<ExecutionId, SchedulerError> {
        self.send_command(
            |reply| SchedulerCommand::DispatchNow { job_id, reply },
            "dispatch",
        )
        .await?
    }

    /// Deactivate a job and drop its queue entry. In-flight attempts are
    /// allowed to complete.
    pub async fn pause(&self, job_id: JobId) -> Result<(), SchedulerError> {
        self.send_command(
            |reply| SchedulerCommand::SetJobActive { job_id, active: false, reply },
            "pause",
        )
        .await?
    }

    /// Reactivate a job; its next occurrence is computed from now.
    pub async fn resume(&self, job_id: JobId) -> Result<(), SchedulerError> {
        self.send_command(
            |reply| SchedulerCommand::SetJobActive { job_id, active: true, reply },
            "resume",
        )
        .await?
    }

    /// Shut down the scheduler. With `drain`, in-flight attempts complete
    /// and are recorded before this returns; without it they are cancelled
    /// and written as failed.
    pub async fn shutdown(&self, drain: bool) -> Result<(), SchedulerError> {
        self.send_command(|reply| SchedulerCommand::Shutdown { drain, reply }, "shutdown")
            .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }
}
