//! Job predicates, orderings and the query builder on top of them.
//!
//! [`JobFilter`] and [`QuerySpec`] are plain data handed to a
//! [`JobStore`](crate::store::JobStore); the store decides how to evaluate
//! them. [`JobFilter::matches`] and [`QuerySpec::apply`] give the reference
//! semantics every store must reproduce.
//!
//! Results are always ordered by the requested keys followed by the job id
//! ascending, so equal keys resolve deterministically.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortProperty {
    JobId,
    Priority,
    DueDate,
    Retries,
    ProcessInstanceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub property: SortProperty,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(property: SortProperty) -> Self {
        Self {
            property,
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: SortProperty) -> Self {
        Self {
            property,
            direction: Direction::Desc,
        }
    }

    fn compare(&self, a: &Job, b: &Job) -> Ordering {
        // `None` sorts first: a job without due date is due immediately.
        let ord = match self.property {
            SortProperty::JobId => a.id.cmp(&b.id),
            SortProperty::Priority => a.priority.cmp(&b.priority),
            SortProperty::DueDate => a.due_date.cmp(&b.due_date),
            SortProperty::Retries => a.retries.cmp(&b.retries),
            SortProperty::ProcessInstanceId => a.process_instance_id.cmp(&b.process_instance_id),
        };
        match self.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

/// Conjunction of optional predicates over jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub job_ids: Option<HashSet<Uuid>>,
    pub process_instance_ids: Option<HashSet<Uuid>>,
    pub job_type: Option<String>,
    /// Inclusive lower bound.
    pub priority_min: Option<i64>,
    /// Inclusive upper bound.
    pub priority_max: Option<i64>,
    /// Strict; jobs without due date never match.
    pub due_before: Option<DateTime<Utc>>,
    /// Strict; jobs without due date never match.
    pub due_after: Option<DateTime<Utc>>,
    pub with_retries_left: bool,
    pub no_retries_left: bool,
    pub executable: bool,
    /// `Some(true)` only suspended jobs, `Some(false)` only active ones.
    pub suspended: Option<bool>,
    /// `Some(true)` only jobs under an unexpired lease, `Some(false)` the rest.
    pub locked: Option<bool>,
    pub with_failure: bool,
    acquirable: bool,
}

impl JobFilter {
    /// The acquisition predicate. Only the scheduler itself builds it; the
    /// public builder cannot switch it on or off.
    pub(crate) fn acquirable() -> Self {
        Self {
            acquirable: true,
            ..Default::default()
        }
    }

    pub fn is_acquisition(&self) -> bool {
        self.acquirable
    }

    pub fn matches(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if self.acquirable && !job.is_acquirable(now) {
            return false;
        }
        if let Some(ids) = &self.job_ids {
            if !ids.contains(&job.id) {
                return false;
            }
        }
        if let Some(ids) = &self.process_instance_ids {
            if !job.process_instance_id.is_some_and(|pid| ids.contains(&pid)) {
                return false;
            }
        }
        if let Some(job_type) = &self.job_type {
            if &job.job_type != job_type {
                return false;
            }
        }
        if self.priority_min.is_some_and(|min| job.priority < min) {
            return false;
        }
        if self.priority_max.is_some_and(|max| job.priority > max) {
            return false;
        }
        if let Some(before) = self.due_before {
            if !job.due_date.is_some_and(|due| due < before) {
                return false;
            }
        }
        if let Some(after) = self.due_after {
            if !job.due_date.is_some_and(|due| due > after) {
                return false;
            }
        }
        if self.with_retries_left && job.retries == 0 {
            return false;
        }
        if self.no_retries_left && job.retries > 0 {
            return false;
        }
        if self.executable && (job.retries == 0 || !job.is_due(now)) {
            return false;
        }
        if self.suspended.is_some_and(|s| s != job.suspended) {
            return false;
        }
        if self.locked.is_some_and(|l| l != job.is_locked(now)) {
            return false;
        }
        if self.with_failure && job.failure.is_none() {
            return false;
        }
        true
    }
}

/// Filter plus ordering and paging, as handed to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySpec {
    pub filter: JobFilter,
    pub order: Vec<OrderBy>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl QuerySpec {
    /// Eligible jobs, highest priority first, then earliest due date.
    pub(crate) fn acquisition(limit: usize) -> Self {
        Self {
            filter: JobFilter::acquirable(),
            order: vec![
                OrderBy::desc(SortProperty::Priority),
                OrderBy::asc(SortProperty::DueDate),
            ],
            offset: 0,
            limit: Some(limit),
        }
    }

    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        self.order
            .iter()
            .map(|o| o.compare(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| a.id.cmp(&b.id))
    }

    /// Reference evaluation: filter, sort, then page.
    pub fn apply<'a, I>(&self, jobs: I, now: DateTime<Utc>) -> Vec<Job>
    where
        I: IntoIterator<Item = &'a Job>,
    {
        let mut matched: Vec<&Job> = jobs
            .into_iter()
            .filter(|j| self.filter.matches(j, now))
            .collect();
        matched.sort_by(|a, b| self.compare(a, b));
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// Builder for ad-hoc job queries.
///
/// Predicates are ANDed. Misuse (a direction without an ordering, an
/// ordering without a direction, empty id sets) is reported by the terminal
/// operation as [`SchedulerError::InvalidQuery`].
#[derive(Clone)]
pub struct JobQuery {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    filter: JobFilter,
    order: Vec<OrderBy>,
    pending_order: Option<SortProperty>,
    error: Option<String>,
}

impl JobQuery {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            filter: JobFilter::default(),
            order: Vec::new(),
            pending_order: None,
            error: None,
        }
    }

    fn fail(mut self, message: impl Into<String>) -> Self {
        self.error.get_or_insert_with(|| message.into());
        self
    }

    pub fn job_id(mut self, id: Uuid) -> Self {
        self.filter.job_ids = Some(HashSet::from([id]));
        self
    }

    pub fn job_ids(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        let ids: HashSet<Uuid> = ids.into_iter().collect();
        if ids.is_empty() {
            return self.fail("job id set is empty");
        }
        self.filter.job_ids = Some(ids);
        self
    }

    pub fn process_instance_id(mut self, id: Uuid) -> Self {
        self.filter.process_instance_ids = Some(HashSet::from([id]));
        self
    }

    pub fn process_instance_ids(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        let ids: HashSet<Uuid> = ids.into_iter().collect();
        if ids.is_empty() {
            return self.fail("process instance id set is empty");
        }
        self.filter.process_instance_ids = Some(ids);
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.filter.job_type = Some(job_type.into());
        self
    }

    pub fn priority_lower_than_or_equals(mut self, priority: i64) -> Self {
        self.filter.priority_max = Some(priority);
        self
    }

    pub fn priority_higher_than_or_equals(mut self, priority: i64) -> Self {
        self.filter.priority_min = Some(priority);
        self
    }

    pub fn due_date_lower_than(mut self, at: DateTime<Utc>) -> Self {
        self.filter.due_before = Some(at);
        self
    }

    pub fn due_date_higher_than(mut self, at: DateTime<Utc>) -> Self {
        self.filter.due_after = Some(at);
        self
    }

    pub fn with_retries_left(mut self) -> Self {
        self.filter.with_retries_left = true;
        self
    }

    pub fn no_retries_left(mut self) -> Self {
        self.filter.no_retries_left = true;
        self
    }

    /// Retries left and due (or no due date) at query time.
    pub fn executable(mut self) -> Self {
        self.filter.executable = true;
        self
    }

    pub fn active(mut self) -> Self {
        self.filter.suspended = Some(false);
        self
    }

    pub fn suspended(mut self) -> Self {
        self.filter.suspended = Some(true);
        self
    }

    pub fn locked(mut self) -> Self {
        self.filter.locked = Some(true);
        self
    }

    pub fn not_locked(mut self) -> Self {
        self.filter.locked = Some(false);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.filter.with_failure = true;
        self
    }

    fn order_by(mut self, property: SortProperty) -> Self {
        if self.pending_order.is_some() {
            return self.fail("call asc() or desc() after using order_by_*()");
        }
        self.pending_order = Some(property);
        self
    }

    pub fn order_by_job_id(self) -> Self {
        self.order_by(SortProperty::JobId)
    }

    pub fn order_by_job_priority(self) -> Self {
        self.order_by(SortProperty::Priority)
    }

    pub fn order_by_due_date(self) -> Self {
        self.order_by(SortProperty::DueDate)
    }

    pub fn order_by_retries(self) -> Self {
        self.order_by(SortProperty::Retries)
    }

    pub fn order_by_process_instance_id(self) -> Self {
        self.order_by(SortProperty::ProcessInstanceId)
    }

    fn direction(mut self, direction: Direction) -> Self {
        match self.pending_order.take() {
            Some(property) => {
                self.order.push(OrderBy {
                    property,
                    direction,
                });
                self
            }
            None => self.fail("call an order_by_*() method before specifying a direction"),
        }
    }

    pub fn asc(self) -> Self {
        self.direction(Direction::Asc)
    }

    pub fn desc(self) -> Self {
        self.direction(Direction::Desc)
    }

    fn spec(&self) -> Result<QuerySpec> {
        if let Some(message) = &self.error {
            return Err(SchedulerError::InvalidQuery(message.clone()));
        }
        if self.pending_order.is_some() {
            return Err(SchedulerError::InvalidQuery(
                "call asc() or desc() after using order_by_*()".to_string(),
            ));
        }
        Ok(QuerySpec {
            filter: self.filter.clone(),
            order: self.order.clone(),
            offset: 0,
            limit: None,
        })
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        let spec = self.spec()?;
        Ok(self.store.query(&spec, self.clock.now()).await?)
    }

    pub async fn list_page(&self, first_result: usize, max_results: usize) -> Result<Vec<Job>> {
        let spec = QuerySpec {
            offset: first_result,
            limit: Some(max_results),
            ..self.spec()?
        };
        Ok(self.store.query(&spec, self.clock.now()).await?)
    }

    pub async fn count(&self) -> Result<u64> {
        let spec = self.spec()?;
        Ok(self.store.count(&spec.filter, self.clock.now()).await?)
    }

    /// At most one job; more than one match is a usage error.
    pub async fn single_result(&self) -> Result<Option<Job>> {
        let spec = QuerySpec {
            limit: Some(2),
            ..self.spec()?
        };
        let mut jobs = self.store.query(&spec, self.clock.now()).await?;
        if jobs.len() > 1 {
            let total = self.store.count(&spec.filter, self.clock.now()).await?;
            return Err(SchedulerError::NonUniqueResult(total as usize));
        }
        Ok(jobs.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::job_types;
    use chrono::Duration;

    fn job_with_priority(priority: i64, now: DateTime<Utc>) -> Job {
        Job::new(job_types::MESSAGE, priority, now)
    }

    #[test]
    fn priority_bounds_are_inclusive() {
        let now = Utc::now();
        let filter = JobFilter {
            priority_min: Some(2),
            priority_max: Some(2),
            ..Default::default()
        };
        assert!(filter.matches(&job_with_priority(2, now), now));
        assert!(!filter.matches(&job_with_priority(1, now), now));
        assert!(!filter.matches(&job_with_priority(3, now), now));
    }

    #[test]
    fn contradictory_bounds_match_nothing() {
        let now = Utc::now();
        let filter = JobFilter {
            priority_min: Some(3),
            priority_max: Some(2),
            ..Default::default()
        };
        assert!((0..5).all(|p| !filter.matches(&job_with_priority(p, now), now)));
    }

    #[test]
    fn due_bounds_skip_jobs_without_due_date() {
        let now = Utc::now();
        let filter = JobFilter {
            due_before: Some(now + Duration::hours(1)),
            ..Default::default()
        };
        assert!(!filter.matches(&job_with_priority(0, now), now));
        assert!(filter.matches(&job_with_priority(0, now).with_due_date(now), now));
    }

    #[test]
    fn acquisition_filter_rejects_locked_jobs() {
        let now = Utc::now();
        let filter = JobFilter::acquirable();
        let job = job_with_priority(0, now);
        assert!(filter.matches(&job, now));
        let locked = job.claimed_by("node-1", now + Duration::seconds(30));
        assert!(!filter.matches(&locked, now));
        assert!(filter.matches(&locked, now + Duration::seconds(30)));
    }

    #[test]
    fn acquisition_order_is_priority_desc_then_due_date() {
        let now = Utc::now();
        let late_high = job_with_priority(5, now).with_due_date(now - Duration::seconds(1));
        let early_high = job_with_priority(5, now).with_due_date(now - Duration::seconds(10));
        let low = job_with_priority(1, now);
        let jobs = [low.clone(), late_high.clone(), early_high.clone()];

        let ordered = QuerySpec::acquisition(10).apply(jobs.iter(), now);
        let ids: Vec<Uuid> = ordered.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![early_high.id, late_high.id, low.id]);
    }

    #[test]
    fn ties_resolve_by_job_id() {
        let now = Utc::now();
        let jobs: Vec<Job> = (0..5).map(|_| job_with_priority(1, now)).collect();
        let spec = QuerySpec {
            order: vec![OrderBy::desc(SortProperty::Priority)],
            ..Default::default()
        };
        let ordered = spec.apply(jobs.iter(), now);
        let mut expected: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        expected.sort();
        assert_eq!(ordered.iter().map(|j| j.id).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn paging_applies_after_sorting() {
        let now = Utc::now();
        let jobs: Vec<Job> = (0..5).map(|p| job_with_priority(p, now)).collect();
        let spec = QuerySpec {
            order: vec![OrderBy::asc(SortProperty::Priority)],
            offset: 1,
            limit: Some(2),
            ..Default::default()
        };
        let page: Vec<i64> = spec.apply(jobs.iter(), now).iter().map(|j| j.priority).collect();
        assert_eq!(page, vec![1, 2]);
    }
}
