use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::{to_chrono, Clock};
use crate::config::SchedulerConfig;
use crate::scheduler::job::Job;
use crate::scheduler::query::QuerySpec;
use crate::store::{JobStore, StoreError, WriteBatch};
use crate::worker::pool::PoolSender;

/// Result of one acquisition cycle
#[derive(Debug, Default)]
pub struct AcquisitionOutcome {
    /// Eligible jobs returned by the query.
    pub candidates: usize,
    /// Jobs now held by this node, with their post-claim revision.
    pub claimed: Vec<Job>,
    /// Candidates another node claimed first.
    pub conflicts: usize,
    /// Store failure that cut the cycle short after some jobs were already
    /// claimed. Those jobs are still in `claimed`.
    pub aborted: Option<StoreError>,
}

/// Wait between cycles: doubles after every idle cycle up to `max`, drops
/// back to `min` as soon as a cycle claims something.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Drop back to `min` without a claim, e.g. while the pool is saturated
    /// and work is known to be waiting.
    pub fn reset(&mut self) -> Duration {
        self.current = self.min;
        self.current
    }

    /// Feed the number of jobs the last cycle claimed; returns the next wait.
    pub fn record(&mut self, claimed: usize) -> Duration {
        self.current = if claimed > 0 {
            self.min
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
        self.current
    }
}

/// Periodic selection and optimistic claiming of due jobs for one node.
pub struct AcquisitionCycle {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    lock_owner: String,
    lease: Duration,
    max_jobs: usize,
    interval: IdleBackoff,
}

impl AcquisitionCycle {
    pub fn new(config: &SchedulerConfig, store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock_owner: config.lock_owner.clone(),
            lease: config.lock_lease_duration,
            max_jobs: config.max_jobs_per_acquisition,
            interval: IdleBackoff::new(
                config.acquisition_interval_min,
                config.acquisition_interval_max,
            ),
        }
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    pub fn current_interval(&self) -> Duration {
        self.interval.current()
    }

    /// Claim `job` for this node, conditioned on the revision it was read
    /// with. Returns the claimed copy carrying the new revision.
    pub async fn claim(&self, job: &Job) -> Result<Job, StoreError> {
        let expires_at = self.clock.now() + to_chrono(self.lease);
        let mut claimed = job.claimed_by(&self.lock_owner, expires_at);
        self.store
            .commit(WriteBatch::new().update_job(claimed.clone()))
            .await?;
        claimed.revision += 1;
        Ok(claimed)
    }

    /// One cycle with the configured batch size.
    pub async fn acquire_once(&self) -> Result<AcquisitionOutcome, StoreError> {
        self.acquire(self.max_jobs).await
    }

    /// One cycle claiming at most `limit` jobs. Losing a race is not an
    /// error; only a failing store aborts the cycle.
    ///
    /// Every successful claim is its own committed write, so a store failure
    /// after some claims stops the cycle but still returns those jobs in
    /// [`AcquisitionOutcome::claimed`]. `Err` means nothing was claimed.
    pub async fn acquire(&self, limit: usize) -> Result<AcquisitionOutcome, StoreError> {
        let limit = limit.min(self.max_jobs);
        if limit == 0 {
            return Ok(AcquisitionOutcome::default());
        }

        let candidates = self
            .store
            .query(&QuerySpec::acquisition(limit), self.clock.now())
            .await?;

        let mut outcome = AcquisitionOutcome {
            candidates: candidates.len(),
            ..Default::default()
        };
        for job in &candidates {
            match self.claim(job).await {
                Ok(claimed) => outcome.claimed.push(claimed),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(
                        job_id = %job.id,
                        lock_owner = %self.lock_owner,
                        "Job claimed by another node, skipping"
                    );
                    outcome.conflicts += 1;
                }
                Err(e) if outcome.claimed.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        lock_owner = %self.lock_owner,
                        error = %e,
                        claimed = outcome.claimed.len(),
                        "Store failed mid-cycle, keeping jobs already claimed"
                    );
                    outcome.aborted = Some(e);
                    break;
                }
            }
        }

        if !outcome.claimed.is_empty() {
            tracing::debug!(
                lock_owner = %self.lock_owner,
                claimed = outcome.claimed.len(),
                conflicts = outcome.conflicts,
                "Jobs acquired"
            );
        }
        Ok(outcome)
    }

    /// Acquisition loop feeding claimed jobs into the pool until `shutdown`
    /// fires or the pool goes away.
    ///
    /// Only as many jobs as the pool has free workers are claimed per cycle,
    /// so this node never holds a lease on work it cannot start right away.
    pub async fn run(mut self, pool: PoolSender, shutdown: CancellationToken) {
        tracing::info!(lock_owner = %self.lock_owner, "Acquisition started");

        loop {
            let free = pool.free_slots();
            // A saturated pool means work is flowing; poll again soon.
            let wait = if free == 0 {
                self.interval.reset()
            } else {
                match self.acquire(free).await {
                    Ok(outcome) => {
                        let claimed = outcome.claimed.len();
                        for job in outcome.claimed {
                            if pool.send(job).await.is_err() {
                                tracing::debug!("Execution pool closed, stopping acquisition");
                                return;
                            }
                        }
                        self.interval.record(claimed)
                    }
                    Err(e) => {
                        tracing::warn!(
                            lock_owner = %self.lock_owner,
                            error = %e,
                            "Acquisition cycle aborted"
                        );
                        self.interval.record(0)
                    }
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!(lock_owner = %self.lock_owner, "Acquisition stopped");
    }
}
