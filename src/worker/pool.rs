use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::scheduler::job::{Incident, Job, Lease};
use crate::scheduler::priority::{JobDefaults, PriorityResolver};
use crate::scheduler::retry::{FailureOutcome, RetryPolicy};
use crate::store::{JobStore, StoreError, WriteBatch};
use crate::worker::handler::{ExecutionContext, HandlerFailure, HandlerRegistry};

/// How a single execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded; the job is gone and its side effects are visible.
    Completed,
    /// Handler failed with retries left.
    Retried { due_date: Option<DateTime<Utc>> },
    /// Handler failed for the last time.
    Dead(Incident),
    /// Another node took the job over; nothing was written.
    LeaseLost,
    /// Shutdown interrupted the handler; the lease was released.
    Cancelled,
    StoreFailed(StoreError),
}

enum Transition {
    Complete(WriteBatch),
    Fail {
        failure: String,
        outcome: FailureOutcome,
    },
}

impl Transition {
    fn to_batch(&self, job: &Job) -> WriteBatch {
        match self {
            // Delete first: a staged removal of the job's own process
            // instance must not swallow the revision check.
            Transition::Complete(effects) => {
                let mut batch = WriteBatch::new().delete_job(job);
                batch.extend(effects.ops().iter().cloned());
                batch
            }
            Transition::Fail { outcome, .. } => outcome.to_batch(),
        }
    }

    /// Re-apply the failure to the fresh copy, so retries an operator reset
    /// in the meantime are consumed from instead of overwritten.
    fn rebase(self, current: &Job, retry: &RetryPolicy, now: DateTime<Utc>) -> Self {
        match self {
            Transition::Complete(effects) => Transition::Complete(effects),
            Transition::Fail { failure, .. } => Transition::Fail {
                outcome: retry.on_failure(current, &failure, now),
                failure,
            },
        }
    }
}

/// Runs claimed jobs through their handlers and persists the result.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    handlers: HandlerRegistry,
    retry: RetryPolicy,
    resolver: Arc<dyn PriorityResolver>,
    defaults: JobDefaults,
    lock_owner: String,
    incidents: broadcast::Sender<Incident>,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        handlers: HandlerRegistry,
        retry: RetryPolicy,
        resolver: Arc<dyn PriorityResolver>,
        defaults: JobDefaults,
        lock_owner: impl Into<String>,
        incidents: broadcast::Sender<Incident>,
    ) -> Self {
        Self {
            store,
            clock,
            handlers,
            retry,
            resolver,
            defaults,
            lock_owner: lock_owner.into(),
            incidents,
        }
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    /// Execute one job this node has claimed.
    ///
    /// `job` must carry the revision returned by the claim. Completion and
    /// failure are written conditioned on that revision; if a concurrent
    /// writer bumped it while the lease is still ours, the write is retried
    /// once against the fresh copy.
    pub async fn execute(&self, job: Job, cancel: &CancellationToken) -> ExecutionOutcome {
        let Some(lease) = job.lock.clone() else {
            tracing::warn!(job_id = %job.id, "Refusing to execute a job without a lease");
            return ExecutionOutcome::LeaseLost;
        };
        if lease.owner != self.lock_owner || lease.is_expired(self.clock.now()) {
            tracing::warn!(
                job_id = %job.id,
                lock_owner = %lease.owner,
                "Lease expired before execution started"
            );
            return ExecutionOutcome::LeaseLost;
        }

        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Executing job");

        let started = self.clock.now();
        let result = match self.handlers.get(&job.job_type) {
            Some(handler) => {
                let mut ctx = ExecutionContext::new(
                    started,
                    self.lock_owner.clone(),
                    self.resolver.clone(),
                    self.defaults,
                );
                let task_job = job.clone();
                let mut task = tokio::spawn(async move {
                    let result = handler.execute(&task_job, &mut ctx).await;
                    (result, ctx)
                });

                tokio::select! {
                    joined = &mut task => match joined {
                        Ok((Ok(()), ctx)) => Ok(ctx.into_effects()),
                        Ok((Err(failure), _)) => Err(failure),
                        Err(e) => Err(HandlerFailure::new(format!("handler panicked: {}", e))),
                    },
                    _ = cancel.cancelled() => {
                        task.abort();
                        tracing::info!(job_id = %job.id, "Execution cancelled, releasing job");
                        self.release(&job).await;
                        return ExecutionOutcome::Cancelled;
                    }
                }
            }
            None => Err(HandlerFailure::new(format!(
                "no handler registered for job type '{}'",
                job.job_type
            ))),
        };

        let transition = match result {
            Ok(effects) => Transition::Complete(effects),
            Err(failure) => {
                tracing::info!(
                    job_id = %job.id,
                    error = %failure,
                    retries = job.retries,
                    "Job failed"
                );
                let now = self.clock.now();
                Transition::Fail {
                    outcome: self.retry.on_failure(&job, &failure.message, now),
                    failure: failure.message,
                }
            }
        };

        self.finish(job, &lease, transition).await
    }

    async fn finish(&self, job: Job, lease: &Lease, transition: Transition) -> ExecutionOutcome {
        let transition = match self.store.commit(transition.to_batch(&job)).await {
            Ok(()) => return self.committed(&job, transition),
            Err(e) if e.is_conflict() => transition,
            Err(e) => return self.store_failed(&job, e),
        };

        let current = match self.store.get(job.id).await {
            Ok(Some(current)) if current.is_held_under(lease) => current,
            Ok(_) => return self.lease_lost(&job),
            Err(e) => return self.store_failed(&job, e),
        };

        let transition = transition.rebase(&current, &self.retry, self.clock.now());
        match self.store.commit(transition.to_batch(&current)).await {
            Ok(()) => self.committed(&current, transition),
            Err(e) if e.is_conflict() => self.lease_lost(&job),
            Err(e) => self.store_failed(&job, e),
        }
    }

    fn committed(&self, job: &Job, transition: Transition) -> ExecutionOutcome {
        match transition {
            Transition::Complete(_) => {
                tracing::debug!(job_id = %job.id, "Job completed");
                ExecutionOutcome::Completed
            }
            Transition::Fail {
                outcome: FailureOutcome::Retry(next),
                ..
            } => ExecutionOutcome::Retried {
                due_date: next.due_date,
            },
            Transition::Fail {
                outcome: FailureOutcome::Dead { incident, .. },
                ..
            } => {
                tracing::warn!(
                    job_id = %job.id,
                    incident_id = %incident.id,
                    failure = %incident.failure,
                    "Job out of retries, incident raised"
                );
                // No subscribers is fine.
                let _ = self.incidents.send(incident.clone());
                ExecutionOutcome::Dead(incident)
            }
        }
    }

    fn lease_lost(&self, job: &Job) -> ExecutionOutcome {
        tracing::warn!(job_id = %job.id, lock_owner = %self.lock_owner, "Lease lost, discarding result");
        ExecutionOutcome::LeaseLost
    }

    fn store_failed(&self, job: &Job, e: StoreError) -> ExecutionOutcome {
        tracing::error!(job_id = %job.id, error = %e, "Failed to persist execution result");
        ExecutionOutcome::StoreFailed(e)
    }

    /// Hand a claimed job back without running it. A job that changed in the
    /// meantime is left alone; its lease simply expires.
    pub async fn release(&self, job: &Job) {
        match self
            .store
            .commit(WriteBatch::new().update_job(job.released()))
            .await
        {
            Ok(()) => tracing::debug!(job_id = %job.id, "Job released"),
            Err(e) if e.is_conflict() => {
                tracing::debug!(job_id = %job.id, "Job changed since claim, not releasing")
            }
            Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to release job"),
        }
    }
}

/// Producer side of the pool's queue, handed to the acquisition loop.
///
/// Tracks jobs that were sent but have not finished executing, so the
/// producer never claims more than the pool can run right away.
#[derive(Clone)]
pub struct PoolSender {
    tx: mpsc::Sender<Job>,
    busy: Arc<AtomicUsize>,
    workers: usize,
}

impl PoolSender {
    /// Workers neither running nor about to run a job.
    pub fn free_slots(&self) -> usize {
        self.workers.saturating_sub(self.busy.load(Ordering::SeqCst))
    }

    /// Queue a claimed job. Hands the job back if the pool has shut down.
    pub async fn send(&self, job: Job) -> Result<(), Job> {
        self.busy.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).await.map_err(|e| {
            self.busy.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }
}

/// Fixed set of workers pulling claimed jobs from a bounded queue.
pub struct ExecutionPool {
    sender: PoolSender,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    runner: Arc<JobRunner>,
    workers: Vec<JoinHandle<()>>,
}

impl ExecutionPool {
    /// Spawn `workers` workers; at most `workers` handlers run at any time.
    pub fn start(runner: Arc<JobRunner>, workers: usize, shutdown: CancellationToken) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(workers);
        let rx = Arc::new(Mutex::new(rx));
        let busy = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers)
            .map(|worker| {
                let rx = rx.clone();
                let runner = runner.clone();
                let busy = busy.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker_loop(worker, rx, runner, busy, shutdown).await })
            })
            .collect();

        Self {
            sender: PoolSender { tx, busy, workers },
            rx,
            runner,
            workers: handles,
        }
    }

    pub fn sender(&self) -> PoolSender {
        self.sender.clone()
    }

    /// Wait for all workers to stop, then release whatever is still queued.
    pub async fn join(self) {
        drop(self.sender);
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut released = 0usize;
        while let Ok(job) = rx.try_recv() {
            self.runner.release(&job).await;
            released += 1;
        }
        if released > 0 {
            tracing::info!(released, "Released queued jobs on shutdown");
        }
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    runner: Arc<JobRunner>,
    busy: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker, "Worker started");
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        let outcome = runner.execute(job, &shutdown.child_token()).await;
        busy.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(worker, ?outcome, "Execution finished");
    }
    tracing::debug!(worker, "Worker stopped");
}
