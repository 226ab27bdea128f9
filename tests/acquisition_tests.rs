//! Acquisition tests: competing nodes, lease expiry, suspension and due
//! dates.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use jobexec_lite::clock::{Clock, ManualClock};
use jobexec_lite::scheduler::acquisition::AcquisitionCycle;
use jobexec_lite::scheduler::job::{job_types, Incident, Job};
use jobexec_lite::scheduler::query::{JobFilter, JobQuery, QuerySpec};
use jobexec_lite::store::{JobStore, MemoryJobStore, StoreError, WriteBatch};
use jobexec_lite::SchedulerConfig;

fn cycle(
    owner: &str,
    store: &Arc<MemoryJobStore>,
    clock: &ManualClock,
    lease: Duration,
) -> AcquisitionCycle {
    let config = SchedulerConfig::new(owner)
        .with_max_jobs_per_acquisition(4)
        .with_lock_lease_duration(lease);
    AcquisitionCycle::new(&config, store.clone(), Arc::new(clock.clone()))
}

/// Memory store whose `fail_at`-th commit (1-based) reports the store as
/// unavailable without applying anything.
struct FlakyStore {
    inner: MemoryJobStore,
    commits: AtomicUsize,
    fail_at: usize,
}

impl FlakyStore {
    fn new(fail_at: usize) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            commits: AtomicUsize::new(0),
            fail_at,
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get(id).await
    }

    async fn query(&self, spec: &QuerySpec, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.inner.query(spec, now).await
    }

    async fn count(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.count(filter, now).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.commits.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.commit(batch).await
    }

    async fn incidents(&self, job_id: Option<Uuid>) -> Result<Vec<Incident>, StoreError> {
        self.inner.incidents(job_id).await
    }

    async fn statistics(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, u64>, StoreError> {
        self.inner.statistics(now).await
    }
}

async fn locked_ids(store: Arc<FlakyStore>, clock: &ManualClock) -> HashSet<Uuid> {
    JobQuery::new(store, Arc::new(clock.clone()))
        .locked()
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect()
}

async fn insert_jobs(store: &MemoryJobStore, clock: &ManualClock, count: usize) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for i in 0..count {
        let job = Job::new(job_types::ASYNC_CONTINUATION, (i % 5) as i64, clock.now());
        ids.push(job.id);
        store.insert(job).await.unwrap();
    }
    ids
}

/// Many nodes acquiring concurrently never claim the same job twice
#[tokio::test]
async fn test_concurrent_acquisition_claims_each_job_once() {
    let store = Arc::new(MemoryJobStore::new());
    let clock = ManualClock::default();
    let ids = insert_jobs(&store, &clock, 40).await;

    let mut tasks = Vec::new();
    for n in 0..5 {
        let cycle = cycle(&format!("node-{}", n), &store, &clock, Duration::from_secs(60));
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            let mut conflicts = 0;
            loop {
                let outcome = cycle.acquire_once().await.unwrap();
                conflicts += outcome.conflicts;
                if outcome.candidates == 0 {
                    break;
                }
                claimed.extend(outcome.claimed);
                tokio::task::yield_now().await;
            }
            (claimed, conflicts)
        }));
    }

    let mut all_claims = Vec::new();
    for task in tasks {
        let (claimed, _conflicts) = task.await.unwrap();
        all_claims.extend(claimed);
    }

    let unique: HashSet<Uuid> = all_claims.iter().map(|j| j.id).collect();
    assert_eq!(all_claims.len(), ids.len(), "every job claimed exactly once");
    assert_eq!(unique, ids.into_iter().collect::<HashSet<_>>());

    // Stored lease owners match the claims that succeeded.
    for job in &all_claims {
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.lock_owner(), job.lock_owner());
        assert_eq!(stored.revision, job.revision);
    }
}

/// A stale claim attempt loses against a fresher one
#[tokio::test]
async fn test_stale_claim_conflicts() {
    let store = Arc::new(MemoryJobStore::new());
    let clock = ManualClock::default();
    let a = cycle("node-a", &store, &clock, Duration::from_secs(60));
    let b = cycle("node-b", &store, &clock, Duration::from_secs(60));

    let job = Job::new(job_types::MESSAGE, 0, clock.now());
    store.insert(job.clone()).await.unwrap();

    let claimed = a.claim(&job).await.unwrap();
    let err = b.claim(&job).await.unwrap_err();
    assert!(err.is_conflict());

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored, claimed);
}

/// A job whose lease expired can be acquired by another node
#[tokio::test]
async fn test_expired_lease_is_reacquired() {
    let store = Arc::new(MemoryJobStore::new());
    let clock = ManualClock::default();
    let a = cycle("node-a", &store, &clock, Duration::from_secs(30));
    let b = cycle("node-b", &store, &clock, Duration::from_secs(30));
    insert_jobs(&store, &clock, 1).await;

    let first = a.acquire_once().await.unwrap();
    assert_eq!(first.claimed.len(), 1);
    assert_eq!(b.acquire_once().await.unwrap().candidates, 0);

    // Expiration is inclusive: at exactly the expiry instant the lease is gone.
    clock.advance(chrono::Duration::seconds(30));
    let second = b.acquire_once().await.unwrap();
    assert_eq!(second.claimed.len(), 1);
    assert_eq!(second.claimed[0].id, first.claimed[0].id);
    assert_eq!(second.claimed[0].lock_owner(), Some("node-b"));
    assert_eq!(second.claimed[0].revision, first.claimed[0].revision + 1);
}

/// Suspended jobs are skipped until activated
#[tokio::test]
async fn test_suspended_job_is_not_acquired() {
    let store = Arc::new(MemoryJobStore::new());
    let clock = ManualClock::default();
    let a = cycle("node-a", &store, &clock, Duration::from_secs(30));

    let mut job = Job::new(job_types::TIMER, 9, clock.now());
    job.suspended = true;
    store.insert(job.clone()).await.unwrap();

    assert_eq!(a.acquire_once().await.unwrap().candidates, 0);

    let mut active = store.get(job.id).await.unwrap().unwrap();
    active.suspended = false;
    store
        .commit(jobexec_lite::store::WriteBatch::new().update_job(active))
        .await
        .unwrap();

    let outcome = a.acquire_once().await.unwrap();
    assert_eq!(outcome.claimed.len(), 1);
    assert_eq!(outcome.claimed[0].priority, 9);
}

/// Jobs are acquired once their due date passes, higher priority first
#[tokio::test]
async fn test_due_date_and_priority_gate_acquisition() {
    let store = Arc::new(MemoryJobStore::new());
    let clock = ManualClock::default();
    let a = cycle("node-a", &store, &clock, Duration::from_secs(30));

    let due_later = Job::new(job_types::TIMER, 100, clock.now())
        .with_due_date(clock.now() + chrono::Duration::minutes(5));
    let low = Job::new(job_types::TIMER, 1, clock.now());
    let dead = Job::new(job_types::TIMER, 50, clock.now()).with_retries(0);
    for job in [&due_later, &low, &dead] {
        store.insert(job.clone()).await.unwrap();
    }

    let outcome = a.acquire_once().await.unwrap();
    let claimed: Vec<Uuid> = outcome.claimed.iter().map(|j| j.id).collect();
    assert_eq!(claimed, vec![low.id]);

    clock.advance(chrono::Duration::minutes(5));
    let outcome = a.acquire_once().await.unwrap();
    let claimed: Vec<Uuid> = outcome.claimed.iter().map(|j| j.id).collect();
    assert_eq!(claimed, vec![due_later.id]);

    assert_eq!(a.acquire_once().await.unwrap().candidates, 0);
}

/// A store failure mid-cycle still hands over the jobs claimed before it
#[tokio::test]
async fn test_store_failure_keeps_earlier_claims() {
    let clock = ManualClock::default();
    let store = Arc::new(FlakyStore::new(5));
    let config = SchedulerConfig::new("node-a")
        .with_max_jobs_per_acquisition(3)
        .with_lock_lease_duration(Duration::from_secs(300));
    let cycle = AcquisitionCycle::new(&config, store.clone(), Arc::new(clock.clone()));

    // Three inserts use up commits 1 to 3, so the second claim fails.
    for priority in [3, 2, 1] {
        store
            .insert(Job::new(job_types::TIMER, priority, clock.now()))
            .await
            .unwrap();
    }

    let outcome = cycle.acquire_once().await.unwrap();
    assert_eq!(outcome.candidates, 3);
    assert_eq!(outcome.claimed.len(), 1);
    assert_eq!(outcome.claimed[0].priority, 3);
    assert!(matches!(outcome.aborted, Some(StoreError::Unavailable(_))));

    // Every lease left in the store belongs to a job the cycle returned.
    let claimed: HashSet<Uuid> = outcome.claimed.iter().map(|j| j.id).collect();
    assert_eq!(locked_ids(store.clone(), &clock).await, claimed);

    // The next cycle picks up the rest.
    let outcome = cycle.acquire_once().await.unwrap();
    assert_eq!(outcome.claimed.len(), 2);
    assert!(outcome.aborted.is_none());
}

/// A store failure on the first claim aborts the cycle without leases
#[tokio::test]
async fn test_store_failure_before_any_claim_is_an_error() {
    let clock = ManualClock::default();
    let store = Arc::new(FlakyStore::new(2));
    let config = SchedulerConfig::new("node-a").with_max_jobs_per_acquisition(3);
    let cycle = AcquisitionCycle::new(&config, store.clone(), Arc::new(clock.clone()));

    store
        .insert(Job::new(job_types::TIMER, 0, clock.now()))
        .await
        .unwrap();

    let err = cycle.acquire_once().await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
    assert!(locked_ids(store.clone(), &clock).await.is_empty());
}
