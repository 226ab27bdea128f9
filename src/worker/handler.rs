use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::Job;
use crate::scheduler::priority::{new_job, CreationContext, JobDefaults, PriorityResolver};
use crate::store::{WriteBatch, WriteOp};

/// Failure reported by a handler. The message becomes the job's failure
/// detail and, once retries run out, the incident's.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerFailure {
    pub message: String,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Side effects a handler wants committed together with its job.
///
/// Nothing staged here is visible to anyone until the handler returns `Ok`
/// and the job's deletion commits; a failing handler's effects are dropped.
pub struct ExecutionContext {
    now: DateTime<Utc>,
    lock_owner: String,
    resolver: Arc<dyn PriorityResolver>,
    defaults: JobDefaults,
    effects: WriteBatch,
}

impl ExecutionContext {
    pub(crate) fn new(
        now: DateTime<Utc>,
        lock_owner: String,
        resolver: Arc<dyn PriorityResolver>,
        defaults: JobDefaults,
    ) -> Self {
        Self {
            now,
            lock_owner,
            resolver,
            defaults,
            effects: WriteBatch::new(),
        }
    }

    /// Time the execution started.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    /// Stage a follow-up job; its priority is resolved right away.
    pub fn create_job(&mut self, job_type: &str, context: CreationContext) -> Uuid {
        let job = new_job(job_type, &context, self.resolver.as_ref(), self.defaults, self.now);
        let id = job.id;
        self.effects.push(WriteOp::InsertJob(job));
        id
    }

    /// Stage removal of a process instance together with all its jobs.
    pub fn remove_process_instance(&mut self, process_instance_id: Uuid) {
        self.effects
            .push(WriteOp::RemoveProcessInstance(process_instance_id));
    }

    pub fn staged(&self) -> &[WriteOp] {
        self.effects.ops()
    }

    pub(crate) fn into_effects(self) -> WriteBatch {
        self.effects
    }
}

/// Executes jobs of one type.
///
/// Jobs are delivered at least once: a handler that outlives its lease may
/// run again elsewhere, so handlers must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job, ctx: &mut ExecutionContext) -> Result<(), HandlerFailure>;
}

/// Handler built from an async closure that needs no side effects.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerFailure>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerFailure>> + Send,
{
    async fn execute(&self, job: &Job, _ctx: &mut ExecutionContext) -> Result<(), HandlerFailure> {
        (self.f)(job.clone()).await
    }
}

/// Maps job types to handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn register_arc(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
