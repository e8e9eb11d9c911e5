//! Scheduler engine for firing jobs at their cron times.
//!
//! This module provides the main scheduling loop that seeds an in-memory
//! queue from the store, dispatches due occurrences to the worker pool,
//! applies the retry state machine to outcomes, and reconciles with the
//! store on a refresh interval.

mod engine;
mod handle;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;

use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by scheduler control operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The worker pool cannot take more work right now.
    #[error("worker pool saturated")]
    PoolSaturated,

    /// The HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    HttpClient(String),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is running.
    Running,
    /// Scheduler has been shut down.
    Stopped,
}

/// Tunables for the scheduling core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the worker pool.
    pub max_workers: usize,
    /// Per-attempt HTTP timeout.
    pub request_timeout: Duration,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Interval between store reconciliations.
    pub refresh_interval: Duration,
    /// Clamp on exponential retry backoff, in seconds.
    pub backoff_cap_seconds: u64,
    /// Truncation of captured failure response bodies, in bytes.
    pub response_capture_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 20,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            refresh_interval: Duration::from_secs(60),
            backoff_cap_seconds: 64,
            response_capture_bytes: 4096,
        }
    }
}
