pub mod acquisition;
pub mod job;
pub mod priority;
pub mod query;
pub mod retry;

pub use acquisition::{AcquisitionCycle, AcquisitionOutcome, IdleBackoff};
pub use job::{job_types, Incident, Job, JobState, Lease};
pub use priority::{
    ConstantPriority, CreationContext, JobDefaults, PriorityResolver, ResolverError,
    VariablePriority,
};
pub use query::{Direction, JobFilter, JobQuery, OrderBy, QuerySpec, SortProperty};
pub use retry::{BackoffStrategy, FailureOutcome, RetryCycle, RetryPolicy};
