use std::time::Duration;

use crate::error::{Result, SchedulerError};
use crate::scheduler::retry::{BackoffStrategy, RetryCycle};

/// Configuration for one scheduler node.
///
/// Every node sharing a store needs a distinct `lock_owner`; it is the
/// identity written into the lease of every job the node claims.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity recorded as lock owner on claimed jobs.
    pub lock_owner: String,

    /// Wait after a cycle that claimed at least one job.
    pub acquisition_interval_min: Duration,

    /// Ceiling for the wait after consecutive idle cycles.
    pub acquisition_interval_max: Duration,

    /// Upper bound of jobs claimed per cycle.
    pub max_jobs_per_acquisition: usize,

    /// How long a claim stays valid. Must exceed the slowest handler run,
    /// otherwise another node may pick the job up again while it is running.
    pub lock_lease_duration: Duration,

    /// Size of the local worker pool.
    pub max_concurrent_executions: usize,

    pub retry_backoff: BackoffStrategy,

    /// Used when the priority resolver fails.
    pub default_priority: i64,

    /// Retries of a job whose creation context does not say otherwise.
    pub default_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_owner: "node-1".to_string(),
            acquisition_interval_min: Duration::from_millis(100),
            acquisition_interval_max: Duration::from_secs(5),
            max_jobs_per_acquisition: 3,
            lock_lease_duration: Duration::from_secs(300),
            max_concurrent_executions: 4,
            retry_backoff: BackoffStrategy::default(),
            default_priority: 0,
            default_retries: crate::scheduler::job::DEFAULT_RETRIES,
        }
    }
}

impl SchedulerConfig {
    pub fn new(lock_owner: impl Into<String>) -> Self {
        Self {
            lock_owner: lock_owner.into(),
            ..Default::default()
        }
    }

    pub fn with_acquisition_interval(mut self, min: Duration, max: Duration) -> Self {
        self.acquisition_interval_min = min;
        self.acquisition_interval_max = max;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max_jobs: usize) -> Self {
        self.max_jobs_per_acquisition = max_jobs;
        self
    }

    pub fn with_lock_lease_duration(mut self, lease: Duration) -> Self {
        self.lock_lease_duration = lease;
        self
    }

    pub fn with_max_concurrent_executions(mut self, workers: usize) -> Self {
        self.max_concurrent_executions = workers;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Take both the retry count and the backoff from a retry time cycle.
    pub fn with_retry_cycle(mut self, cycle: RetryCycle) -> Self {
        self.default_retries = cycle.retries;
        self.retry_backoff = cycle.strategy;
        self
    }

    pub fn with_default_priority(mut self, priority: i64) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SchedulerError::InvalidConfig(msg.to_string()));

        if self.lock_owner.trim().is_empty() {
            return invalid("lock_owner must not be empty");
        }
        if self.acquisition_interval_min.is_zero() {
            return invalid("acquisition_interval_min must be positive");
        }
        if self.acquisition_interval_min > self.acquisition_interval_max {
            return invalid("acquisition_interval_min exceeds acquisition_interval_max");
        }
        if self.max_jobs_per_acquisition == 0 {
            return invalid("max_jobs_per_acquisition must be at least 1");
        }
        if self.lock_lease_duration.is_zero() {
            return invalid("lock_lease_duration must be positive");
        }
        if self.max_concurrent_executions == 0 {
            return invalid("max_concurrent_executions must be at least 1");
        }
        Ok(())
    }
}
