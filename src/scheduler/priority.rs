//! Priority resolution at job creation time.
//!
//! The scheduler never evaluates expressions or reads process state itself.
//! It hands a [`CreationContext`] to a [`PriorityResolver`] once, stores the
//! resulting number on the job, and falls back to a default when resolution
//! fails.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::scheduler::job::{Job, DEFAULT_RETRIES};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("Priority variable '{0}' is not set")]
    MissingVariable(String),

    #[error("Priority variable '{name}' is not an integer: {value}")]
    NotAnInteger { name: String, value: String },

    #[error("Priority resolution failed: {0}")]
    Failed(String),
}

/// Everything known about the process event that creates a job.
#[derive(Debug, Clone, Default)]
pub struct CreationContext {
    pub process_instance_id: Option<Uuid>,
    pub activity_id: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub retries: Option<u32>,
    pub variables: Map<String, Value>,
}

impl CreationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_process_instance(process_instance_id: Uuid) -> Self {
        Self {
            process_instance_id: Some(process_instance_id),
            ..Default::default()
        }
    }

    pub fn activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn due_at(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Computes a job's priority from its creation context.
pub trait PriorityResolver: Send + Sync {
    fn resolve(&self, context: &CreationContext) -> Result<i64, ResolverError>;
}

impl<F> PriorityResolver for F
where
    F: Fn(&CreationContext) -> Result<i64, ResolverError> + Send + Sync,
{
    fn resolve(&self, context: &CreationContext) -> Result<i64, ResolverError> {
        self(context)
    }
}

/// Same priority for every job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantPriority(pub i64);

impl PriorityResolver for ConstantPriority {
    fn resolve(&self, _context: &CreationContext) -> Result<i64, ResolverError> {
        Ok(self.0)
    }
}

/// Reads the priority from a named integer variable of the creation context.
#[derive(Debug, Clone)]
pub struct VariablePriority {
    pub variable: String,
}

impl VariablePriority {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }
}

impl PriorityResolver for VariablePriority {
    fn resolve(&self, context: &CreationContext) -> Result<i64, ResolverError> {
        let value = context
            .variables
            .get(&self.variable)
            .ok_or_else(|| ResolverError::MissingVariable(self.variable.clone()))?;
        value.as_i64().ok_or_else(|| ResolverError::NotAnInteger {
            name: self.variable.clone(),
            value: value.to_string(),
        })
    }
}

/// Values used when neither the resolver nor the creation context provide
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub priority: i64,
    pub retries: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: 0,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl From<&SchedulerConfig> for JobDefaults {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            priority: config.default_priority,
            retries: config.default_retries,
        }
    }
}

/// Build a new job, resolving its priority exactly once. A resolver error
/// never fails creation; the default priority is used instead.
pub fn new_job(
    job_type: &str,
    context: &CreationContext,
    resolver: &dyn PriorityResolver,
    defaults: JobDefaults,
    now: DateTime<Utc>,
) -> Job {
    let priority = match resolver.resolve(context) {
        Ok(priority) => priority,
        Err(e) => {
            tracing::warn!(
                job_type,
                error = %e,
                default_priority = defaults.priority,
                "Priority resolution failed, using default priority"
            );
            defaults.priority
        }
    };

    let mut job = Job::new(job_type, priority, now);
    job.process_instance_id = context.process_instance_id;
    job.activity_id = context.activity_id.clone();
    job.due_date = context.due_date;
    job.retries = context.retries.unwrap_or(defaults.retries);
    job
}
