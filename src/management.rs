//! Operator and engine facing API over the shared store.
//!
//! Everything here goes through the same revision-conditioned writes the
//! executors use, so management calls can race with acquisition on any node
//! without losing updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{Incident, Job};
use crate::scheduler::priority::{new_job, CreationContext, JobDefaults, PriorityResolver};
use crate::scheduler::query::JobQuery;
use crate::store::{JobStore, WriteBatch, WriteOp};

/// Attempts of a read-modify-write before a conflict is surfaced.
const MUTATION_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct ManagementService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn PriorityResolver>,
    defaults: JobDefaults,
    incidents: broadcast::Sender<Incident>,
}

impl ManagementService {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn PriorityResolver>,
        defaults: JobDefaults,
        incidents: broadcast::Sender<Incident>,
    ) -> Self {
        Self {
            store,
            clock,
            resolver,
            defaults,
            incidents,
        }
    }

    /// Create and persist a job. Its priority is resolved here, once.
    pub async fn create_job(&self, job_type: &str, context: CreationContext) -> Result<Job> {
        let job = new_job(
            job_type,
            &context,
            self.resolver.as_ref(),
            self.defaults,
            self.clock.now(),
        );
        self.store.insert(job.clone()).await?;
        tracing::debug!(
            job_id = %job.id,
            job_type,
            priority = job.priority,
            "Job created"
        );
        Ok(job)
    }

    pub fn create_job_query(&self) -> JobQuery {
        JobQuery::new(self.store.clone(), self.clock.clone())
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.store.get(job_id).await?)
    }

    /// Counts per category; every category is present, zero included.
    pub async fn statistics(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self.store.statistics(self.clock.now()).await?)
    }

    /// Live feed of incidents raised by executors of this node.
    pub fn subscribe_incidents(&self) -> broadcast::Receiver<Incident> {
        self.incidents.subscribe()
    }

    /// Open incidents of one job.
    pub async fn incidents(&self, job_id: Uuid) -> Result<Vec<Incident>> {
        Ok(self.store.incidents(Some(job_id)).await?)
    }

    pub async fn all_incidents(&self) -> Result<Vec<Incident>> {
        Ok(self.store.incidents(None).await?)
    }

    /// Give a job `count` fresh retries and resolve its incidents.
    ///
    /// An expired lease left behind is cleared; a live one is kept so an
    /// in-flight execution is not doubled. If that execution fails, it
    /// consumes one of the new retries. The last failure stays visible.
    pub async fn reset_retries(&self, job_id: Uuid, count: u32) -> Result<Job> {
        if count == 0 {
            return Err(SchedulerError::InvalidArgument(
                "retries must be greater than 0".to_string(),
            ));
        }

        let now = self.clock.now();
        let job = self
            .mutate(job_id, |job| {
                let mut next = job.clone();
                next.retries = count;
                if !job.is_locked(now) {
                    next.lock = None;
                }
                (next, vec![WriteOp::DeleteIncidents { job_id }])
            })
            .await?;

        tracing::info!(job_id = %job_id, retries = count, "Job retries reset");
        Ok(job)
    }

    /// Take a job out of acquisition. A running execution is not affected.
    pub async fn suspend_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.set_suspended(job_id, true).await?;
        tracing::info!(job_id = %job_id, "Job suspended");
        Ok(job)
    }

    pub async fn activate_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.set_suspended(job_id, false).await?;
        tracing::info!(job_id = %job_id, "Job activated");
        Ok(job)
    }

    /// Suspend every job of a process instance, one conditional write per
    /// job. Jobs removed concurrently are skipped.
    pub async fn suspend_jobs_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Job>> {
        let jobs = self
            .set_suspended_for_process_instance(process_instance_id, true)
            .await?;
        tracing::info!(
            process_instance_id = %process_instance_id,
            jobs = jobs.len(),
            "Process instance jobs suspended"
        );
        Ok(jobs)
    }

    pub async fn activate_jobs_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Job>> {
        let jobs = self
            .set_suspended_for_process_instance(process_instance_id, false)
            .await?;
        tracing::info!(
            process_instance_id = %process_instance_id,
            jobs = jobs.len(),
            "Process instance jobs activated"
        );
        Ok(jobs)
    }

    /// Drop every job and incident of a process instance.
    pub async fn remove_process_instance(&self, process_instance_id: Uuid) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::RemoveProcessInstance(process_instance_id));
        self.store.commit(batch).await?;
        tracing::info!(process_instance_id = %process_instance_id, "Process instance removed");
        Ok(())
    }

    async fn set_suspended(&self, job_id: Uuid, suspended: bool) -> Result<Job> {
        self.mutate(job_id, |job| {
            let next = Job {
                suspended,
                ..job.clone()
            };
            (next, Vec::new())
        })
        .await
    }

    async fn set_suspended_for_process_instance(
        &self,
        process_instance_id: Uuid,
        suspended: bool,
    ) -> Result<Vec<Job>> {
        let targets = self
            .create_job_query()
            .process_instance_id(process_instance_id)
            .order_by_job_id()
            .asc()
            .list()
            .await?;

        let mut updated = Vec::with_capacity(targets.len());
        for job in targets {
            match self.set_suspended(job.id, suspended).await {
                Ok(job) => updated.push(job),
                Err(SchedulerError::JobNotFound(_)) => {
                    tracing::debug!(job_id = %job.id, "Job removed before update, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    /// Read, change and conditionally write a job, re-reading on conflict.
    async fn mutate<F>(&self, job_id: Uuid, change: F) -> Result<Job>
    where
        F: Fn(&Job) -> (Job, Vec<WriteOp>) + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            let current = self
                .store
                .get(job_id)
                .await?
                .ok_or(SchedulerError::JobNotFound(job_id))?;

            let (mut next, extra) = change(&current);
            let mut batch = WriteBatch::new().update_job(next.clone());
            batch.extend(extra);

            match self.store.commit(batch).await {
                Ok(()) => {
                    next.revision += 1;
                    return Ok(next);
                }
                Err(e) if e.is_conflict() && attempt < MUTATION_ATTEMPTS => {
                    tracing::debug!(job_id = %job_id, attempt, "Concurrent update, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
