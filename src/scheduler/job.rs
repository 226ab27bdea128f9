use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known job types. Handlers are registered per type string, so any
/// other value works as well.
pub mod job_types {
    pub const TIMER: &str = "timer";
    pub const ASYNC_CONTINUATION: &str = "async-continuation";
    pub const MESSAGE: &str = "message";
}

/// Retries a job starts with unless the creation context says otherwise.
pub const DEFAULT_RETRIES: u32 = 3;

/// Derived view of where a job sits in its lifecycle at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for its due date.
    Pending,
    Eligible,
    Locked,
    Suspended,
    /// Retries exhausted; an incident exists.
    Dead,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Eligible => write!(f, "eligible"),
            JobState::Locked => write!(f, "locked"),
            JobState::Suspended => write!(f, "suspended"),
            JobState::Dead => write!(f, "dead"),
        }
    }
}

/// Time-bounded ownership of a job by one executor.
///
/// Owner and expiration only ever exist together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub process_instance_id: Option<Uuid>,
    pub activity_id: Option<String>,
    /// Resolved once at creation, never re-evaluated.
    pub priority: i64,
    /// `None` means due immediately.
    pub due_date: Option<DateTime<Utc>>,
    pub retries: u32,
    /// Failed attempts so far; drives the backoff delay.
    pub attempts: u32,
    pub lock: Option<Lease>,
    pub suspended: bool,
    pub failure: Option<String>,
    /// Optimistic-concurrency guard, bumped by the store on every write.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, priority: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            process_instance_id: None,
            activity_id: None,
            priority,
            due_date: None,
            retries: DEFAULT_RETRIES,
            attempts: 0,
            lock: None,
            suspended: false,
            failure: None,
            revision: 1,
            created_at,
        }
    }

    pub fn with_process_instance(mut self, process_instance_id: Uuid) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn lock_owner(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.owner.as_str())
    }

    pub fn lock_expiration(&self) -> Option<DateTime<Utc>> {
        self.lock.as_ref().map(|l| l.expires_at)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.due_date, Some(due) if due > now)
    }

    /// True while a lease is held and has not yet expired.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    pub fn is_dead(&self) -> bool {
        self.retries == 0
    }

    /// The acquisition predicate: due, not suspended, unlocked or lease
    /// expired, retries left.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && !self.suspended && !self.is_locked(now) && !self.is_dead()
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.is_dead() {
            JobState::Dead
        } else if self.is_locked(now) {
            JobState::Locked
        } else if self.suspended {
            JobState::Suspended
        } else if self.is_due(now) {
            JobState::Eligible
        } else {
            JobState::Pending
        }
    }

    /// Copy of this job held by `owner` until `expires_at`.
    pub fn claimed_by(&self, owner: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            lock: Some(Lease {
                owner: owner.to_string(),
                expires_at,
            }),
            ..self.clone()
        }
    }

    /// Copy of this job with the lease dropped.
    pub fn released(&self) -> Self {
        Self {
            lock: None,
            ..self.clone()
        }
    }

    /// Whether this job is still held under exactly `lease`.
    pub fn is_held_under(&self, lease: &Lease) -> bool {
        self.lock.as_ref() == Some(lease)
    }
}

/// Record of a job whose retries ran out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub job_id: Uuid,
    pub process_instance_id: Option<Uuid>,
    pub job_type: String,
    pub failure: String,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn for_job(job: &Job, failure: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            process_instance_id: job.process_instance_id,
            job_type: job.job_type.clone(),
            failure: failure.into(),
            created_at,
        }
    }
}
