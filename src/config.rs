//! Runtime configuration, layered defaults -> environment.
//!
//! Every knob can be set through the environment (`MAX_WORKERS`,
//! `REQUEST_TIMEOUT`, `DATABASE_URL`, ...). Defaults match the documented
//! behaviour of the scheduler.

use config::{Config as ConfigBuilder, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

use crate::scheduler::SchedulerConfig;

/// Application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Size of the worker pool.
    pub max_workers: usize,
    /// Per-attempt HTTP timeout in seconds.
    pub request_timeout: u64,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Seconds between store reconciliations.
    pub refresh_interval: u64,
    /// Clamp on exponential backoff, in seconds.
    pub backoff_cap_seconds: u64,
    /// Truncation of captured failure response bodies, in bytes.
    pub response_capture_bytes: usize,
    /// SQLite database URL or path. Absent means in-memory state only.
    pub database_url: Option<String>,
    /// Default log filter, overridable with RUST_LOG.
    pub log_level: String,
    /// Address the HTTP API binds to.
    pub bind_addr: String,
}

impl Config {
    /// Load configuration: defaults overridden by environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigBuilder::builder()
            .set_default("max_workers", 20)?
            .set_default("request_timeout", 30)?
            .set_default("max_retries", 3)?
            .set_default("refresh_interval", 60)?
            .set_default("backoff_cap_seconds", 64)?
            .set_default("response_capture_bytes", 4096)?
            .set_default("log_level", "info")?
            .set_default("bind_addr", "127.0.0.1:8565")?
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// The scheduler-facing slice of the configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers,
            request_timeout: Duration::from_secs(self.request_timeout),
            max_retries: self.max_retries,
            refresh_interval: Duration::from_secs(self.refresh_interval),
            backoff_cap_seconds: self.backoff_cap_seconds,
            response_capture_bytes: self.response_capture_bytes,
        }
    }
}
