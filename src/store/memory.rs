use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::scheduler::job::{Incident, Job};
use crate::scheduler::query::{JobFilter, QuerySpec};
use crate::store::{categories, JobStore, StoreError, WriteBatch, WriteOp};

/// In-process store. Every node of a simulated cluster shares one instance
/// behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    incidents: HashMap<Uuid, Incident>,
}

/// Previous row values, replayed in reverse to roll a batch back.
enum Undo {
    Job(Uuid, Option<Job>),
    Incident(Uuid, Option<Incident>),
}

impl Tables {
    fn apply(&mut self, op: WriteOp, undo: &mut Vec<Undo>) -> Result<(), StoreError> {
        match op {
            WriteOp::InsertJob(job) => {
                if self.jobs.contains_key(&job.id) {
                    return Err(StoreError::Duplicate(job.id));
                }
                undo.push(Undo::Job(job.id, None));
                self.jobs.insert(job.id, job);
            }
            WriteOp::UpdateJob(mut job) => {
                self.check_revision(job.id, job.revision)?;
                job.revision += 1;
                let previous = self.jobs.insert(job.id, job.clone());
                undo.push(Undo::Job(job.id, previous));
            }
            WriteOp::DeleteJob { id, revision } => {
                self.check_revision(id, revision)?;
                let previous = self.jobs.remove(&id);
                undo.push(Undo::Job(id, previous));
            }
            WriteOp::InsertIncident(incident) => {
                let previous = self.incidents.insert(incident.id, incident.clone());
                undo.push(Undo::Incident(incident.id, previous));
            }
            WriteOp::DeleteIncidents { job_id } => {
                let ids: Vec<Uuid> = self
                    .incidents
                    .values()
                    .filter(|i| i.job_id == job_id)
                    .map(|i| i.id)
                    .collect();
                for id in ids {
                    let previous = self.incidents.remove(&id);
                    undo.push(Undo::Incident(id, previous));
                }
            }
            WriteOp::RemoveProcessInstance(pid) => {
                let job_ids: Vec<Uuid> = self
                    .jobs
                    .values()
                    .filter(|j| j.process_instance_id == Some(pid))
                    .map(|j| j.id)
                    .collect();
                for id in job_ids {
                    let previous = self.jobs.remove(&id);
                    undo.push(Undo::Job(id, previous));
                }
                let incident_ids: Vec<Uuid> = self
                    .incidents
                    .values()
                    .filter(|i| i.process_instance_id == Some(pid))
                    .map(|i| i.id)
                    .collect();
                for id in incident_ids {
                    let previous = self.incidents.remove(&id);
                    undo.push(Undo::Incident(id, previous));
                }
            }
        }
        Ok(())
    }

    fn check_revision(&self, id: Uuid, expected: u64) -> Result<(), StoreError> {
        let found = self.jobs.get(&id).map(|j| j.revision);
        if found == Some(expected) {
            Ok(())
        } else {
            Err(StoreError::Conflict {
                job_id: id,
                expected,
                found,
            })
        }
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Job(id, Some(job)) => {
                    self.jobs.insert(id, job);
                }
                Undo::Job(id, None) => {
                    self.jobs.remove(&id);
                }
                Undo::Incident(id, Some(incident)) => {
                    self.incidents.insert(id, incident);
                }
                Undo::Incident(id, None) => {
                    self.incidents.remove(&id);
                }
            }
        }
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current number of jobs
    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn query(&self, spec: &QuerySpec, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let tables = self.inner.read().await;
        Ok(spec.apply(tables.jobs.values(), now))
    }

    async fn count(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let tables = self.inner.read().await;
        Ok(tables.jobs.values().filter(|j| filter.matches(j, now)).count() as u64)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        let mut undo = Vec::with_capacity(batch.len());
        for op in batch.into_ops() {
            if let Err(e) = tables.apply(op, &mut undo) {
                tables.rollback(undo);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn incidents(&self, job_id: Option<Uuid>) -> Result<Vec<Incident>, StoreError> {
        let tables = self.inner.read().await;
        let mut incidents: Vec<Incident> = tables
            .incidents
            .values()
            .filter(|i| job_id.map_or(true, |id| i.job_id == id))
            .cloned()
            .collect();
        incidents.sort_by_key(|i| (i.created_at, i.id));
        Ok(incidents)
    }

    async fn statistics(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, u64>, StoreError> {
        let tables = self.inner.read().await;
        let mut stats: BTreeMap<String, u64> = categories::ALL
            .iter()
            .map(|name| (name.to_string(), 0))
            .collect();

        let mut bump = |name: &str| {
            if let Some(count) = stats.get_mut(name) {
                *count += 1;
            }
        };
        for job in tables.jobs.values() {
            bump(categories::JOBS);
            if job.is_acquirable(now) {
                bump(categories::EXECUTABLE_JOBS);
            }
            if job.is_locked(now) {
                bump(categories::LOCKED_JOBS);
            }
            if job.suspended {
                bump(categories::SUSPENDED_JOBS);
            }
            if job.is_dead() {
                bump(categories::DEAD_JOBS);
            }
        }
        stats.insert(
            categories::INCIDENTS.to_string(),
            tables.incidents.len() as u64,
        );
        Ok(stats)
    }
}
