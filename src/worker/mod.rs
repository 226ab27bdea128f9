//! Local execution of claimed jobs.
//!
//! # Components
//!
//! - [`HandlerRegistry`]: job type to [`JobHandler`] mapping
//! - [`ExecutionContext`]: side effects staged by a handler
//! - [`JobRunner`]: runs one job and commits its completion or failure
//! - [`ExecutionPool`]: fixed number of workers fed by the acquisition loop
//!
//! # Execution Flow
//!
//! 1. Acquisition claims a job and sends it into the pool's queue
//! 2. A free worker picks it up and calls the job type's handler
//! 3. On success the job is deleted together with the staged side effects
//! 4. On failure the retry policy decides between rescheduling and an incident
//!
//! Every write is conditioned on the revision the job was claimed with, so a
//! node whose lease was taken over can never overwrite the new owner's state.

pub mod handler;
pub mod pool;

pub use handler::{handler_fn, ExecutionContext, HandlerFailure, HandlerRegistry, JobHandler};
pub use pool::{ExecutionOutcome, ExecutionPool, JobRunner, PoolSender};
