use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Query returned {0} results where at most one was expected")]
    NonUniqueResult(usize),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid retry time cycle '{0}'")]
    InvalidRetryCycle(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
