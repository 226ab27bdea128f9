//! What happens to a job whose handler failed.
//!
//! Every failure consumes one retry. While retries remain the job is released
//! and rescheduled after a backoff delay; the failure that consumes the last
//! retry leaves the job dead and raises an [`Incident`] in the same write.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::to_chrono;
use crate::error::SchedulerError;
use crate::scheduler::job::{Incident, Job};
use crate::store::WriteBatch;

/// Delay before the next attempt, as a function of the failed attempt count
/// (starting at 1).
#[derive(Clone)]
pub enum BackoffStrategy {
    Fixed(Duration),
    /// `initial * factor^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        factor: u32,
        max: Duration,
    },
    /// One interval per attempt; the last one repeats.
    Intervals(Vec<Duration>),
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            BackoffStrategy::Exponential {
                initial,
                factor,
                max,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("factor", factor)
                .field("max", max)
                .finish(),
            BackoffStrategy::Intervals(list) => f.debug_tuple("Intervals").field(list).finish(),
            BackoffStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed(Duration::ZERO)
    }
}

impl BackoffStrategy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential {
                initial,
                factor,
                max,
            } => initial
                .saturating_mul(factor.saturating_pow(attempt - 1))
                .min(*max),
            BackoffStrategy::Intervals(list) => {
                let idx = (attempt as usize - 1).min(list.len().saturating_sub(1));
                list.get(idx).copied().unwrap_or(Duration::ZERO)
            }
            BackoffStrategy::Custom(f) => f(attempt),
        }
    }
}

/// A retry time cycle: how many attempts a job gets and how long to wait
/// between them.
///
/// Parses either `R<n>/<duration>` (n attempts, fixed wait) or a
/// comma-separated list of durations (one attempt per entry). Durations use
/// the ISO-8601 subset `P[nD][T[nH][nM][nS]]`.
#[derive(Debug, Clone)]
pub struct RetryCycle {
    pub retries: u32,
    pub strategy: BackoffStrategy,
}

impl FromStr for RetryCycle {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidRetryCycle(s.to_string());
        let text = s.trim();

        if let Some(rest) = text.strip_prefix('R') {
            let (count, interval) = rest.split_once('/').ok_or_else(invalid)?;
            let retries: u32 = count.parse().map_err(|_| invalid())?;
            let interval = parse_iso_duration(interval).ok_or_else(invalid)?;
            return Ok(Self {
                retries,
                strategy: BackoffStrategy::Fixed(interval),
            });
        }

        let intervals = text
            .split(',')
            .map(|part| parse_iso_duration(part.trim()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(invalid)?;
        Ok(Self {
            retries: intervals.len() as u32,
            strategy: BackoffStrategy::Intervals(intervals),
        })
    }
}

fn parse_iso_duration(text: &str) -> Option<Duration> {
    let body = text.strip_prefix('P')?;
    if body.is_empty() {
        return None;
    }

    let mut secs: u64 = 0;
    let mut digits = String::new();
    let mut in_time = false;
    let mut any_component = false;

    for c in body.chars() {
        match c {
            '0'..='9' => digits.push(c),
            'T' if !in_time && digits.is_empty() => in_time = true,
            unit => {
                let value: u64 = digits.parse().ok()?;
                digits.clear();
                let scale = match (in_time, unit) {
                    (false, 'W') => 7 * 86_400,
                    (false, 'D') => 86_400,
                    (true, 'H') => 3_600,
                    (true, 'M') => 60,
                    (true, 'S') => 1,
                    _ => return None,
                };
                secs = secs.checked_add(value.checked_mul(scale)?)?;
                any_component = true;
            }
        }
    }

    if !digits.is_empty() || !any_component {
        return None;
    }
    Some(Duration::from_secs(secs))
}

/// Result of applying a failure to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Released with one retry less and a new due date.
    Retry(Job),
    /// Out of retries.
    Dead { job: Job, incident: Incident },
}

impl FailureOutcome {
    pub fn job(&self) -> &Job {
        match self {
            FailureOutcome::Retry(job) => job,
            FailureOutcome::Dead { job, .. } => job,
        }
    }

    pub fn incident(&self) -> Option<&Incident> {
        match self {
            FailureOutcome::Retry(_) => None,
            FailureOutcome::Dead { incident, .. } => Some(incident),
        }
    }

    /// The writes that persist this outcome, conditioned on the revision
    /// the job was claimed with.
    pub fn to_batch(&self) -> WriteBatch {
        match self {
            FailureOutcome::Retry(job) => WriteBatch::new().update_job(job.clone()),
            FailureOutcome::Dead { job, incident } => WriteBatch::new()
                .update_job(job.clone())
                .insert_incident(incident.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffStrategy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    pub fn on_failure(&self, job: &Job, failure: &str, now: DateTime<Utc>) -> FailureOutcome {
        let mut next = job.released();
        next.retries = job.retries.saturating_sub(1);
        next.attempts = job.attempts.saturating_add(1);
        next.failure = Some(failure.to_string());

        if next.retries > 0 {
            next.due_date = Some(now + to_chrono(self.backoff.delay(next.attempts)));
            FailureOutcome::Retry(next)
        } else {
            let incident = Incident::for_job(&next, failure, now);
            FailureOutcome::Dead {
                job: next,
                incident,
            }
        }
    }
}
