//! Persistence boundary for jobs and incidents.
//!
//! A [`JobStore`] is shared by every node of a cluster. The only cross-node
//! exclusion it has to offer is [`JobStore::commit`]: a batch of writes that
//! is applied atomically and only if every revision-conditioned job write
//! still sees the revision its writer read.
//!
//! # Revisions
//!
//! [`WriteOp::UpdateJob`] and [`WriteOp::DeleteJob`] carry the revision the
//! writer observed. The store rejects the whole batch with
//! [`StoreError::Conflict`] when the stored revision differs or the job is
//! gone, and otherwise stores updated jobs with `revision + 1`.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::{Incident, Job};
use crate::scheduler::query::{JobFilter, QuerySpec};

pub use memory::MemoryJobStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Revision conflict on job {job_id}: expected {expected}, found {found:?}")]
    Conflict {
        job_id: Uuid,
        expected: u64,
        found: Option<u64>,
    },

    #[error("Job already exists: {0}")]
    Duplicate(Uuid),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Named categories reported by [`JobStore::statistics`].
pub mod categories {
    pub const JOBS: &str = "jobs";
    pub const EXECUTABLE_JOBS: &str = "executable_jobs";
    pub const LOCKED_JOBS: &str = "locked_jobs";
    pub const SUSPENDED_JOBS: &str = "suspended_jobs";
    pub const DEAD_JOBS: &str = "dead_jobs";
    pub const INCIDENTS: &str = "incidents";

    pub const ALL: [&str; 6] = [
        JOBS,
        EXECUTABLE_JOBS,
        LOCKED_JOBS,
        SUSPENDED_JOBS,
        DEAD_JOBS,
        INCIDENTS,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    InsertJob(Job),
    /// Replace the stored job if its revision equals `job.revision`.
    UpdateJob(Job),
    DeleteJob { id: Uuid, revision: u64 },
    InsertIncident(Incident),
    /// Resolve every incident of a job.
    DeleteIncidents { job_id: Uuid },
    /// Drop all jobs and incidents of a process instance, regardless of
    /// their revision.
    RemoveProcessInstance(Uuid),
}

/// Writes committed together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = WriteOp>) {
        self.ops.extend(ops);
    }

    pub fn insert_job(mut self, job: Job) -> Self {
        self.push(WriteOp::InsertJob(job));
        self
    }

    pub fn update_job(mut self, job: Job) -> Self {
        self.push(WriteOp::UpdateJob(job));
        self
    }

    pub fn delete_job(mut self, job: &Job) -> Self {
        self.push(WriteOp::DeleteJob {
            id: job.id,
            revision: job.revision,
        });
        self
    }

    pub fn insert_incident(mut self, incident: Incident) -> Self {
        self.push(WriteOp::InsertIncident(incident));
        self
    }

    pub fn delete_incidents(mut self, job_id: Uuid) -> Self {
        self.push(WriteOp::DeleteIncidents { job_id });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Jobs matching `spec.filter`, ordered and paged as
    /// [`QuerySpec::apply`] does.
    async fn query(&self, spec: &QuerySpec, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn count(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Apply all writes atomically. Any failing revision check or duplicate
    /// insert rejects the whole batch and leaves the store untouched.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        self.commit(WriteBatch::new().insert_job(job)).await
    }

    /// Incidents of one job, or all of them.
    async fn incidents(&self, job_id: Option<Uuid>) -> Result<Vec<Incident>, StoreError>;

    /// Row counts per name in [`categories::ALL`].
    async fn statistics(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, u64>, StoreError>;
}
