//! Job query tests: predicates, ordering, paging and usage errors.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use jobexec_lite::clock::{Clock, ManualClock};
use jobexec_lite::management::ManagementService;
use jobexec_lite::scheduler::job::{job_types, Job};
use jobexec_lite::scheduler::priority::{CreationContext, VariablePriority};
use jobexec_lite::store::MemoryJobStore;
use jobexec_lite::{SchedulerConfig, SchedulerError, SchedulerNode};

fn service() -> (ManagementService, ManualClock) {
    let clock = ManualClock::default();
    let node = SchedulerNode::new(
        SchedulerConfig::new("query-node"),
        Arc::new(MemoryJobStore::new()),
    )
    .unwrap()
    .with_clock(Arc::new(clock.clone()))
    .with_priority_resolver(Arc::new(VariablePriority::new("priority")));
    (node.management(), clock)
}

async fn create(mgmt: &ManagementService, priority: i64) -> Job {
    mgmt.create_job(
        job_types::ASYNC_CONTINUATION,
        CreationContext::new().variable("priority", priority),
    )
    .await
    .unwrap()
}

fn priorities(jobs: &[Job]) -> Vec<i64> {
    jobs.iter().map(|j| j.priority).collect()
}

#[tokio::test]
async fn test_order_by_priority() {
    let (mgmt, _) = service();
    for p in [0, 4, -3, 10, 4] {
        create(&mgmt, p).await;
    }

    let desc = mgmt
        .create_job_query()
        .order_by_job_priority()
        .desc()
        .list()
        .await
        .unwrap();
    assert_eq!(priorities(&desc), vec![10, 4, 4, 0, -3]);

    let asc = mgmt
        .create_job_query()
        .order_by_job_priority()
        .asc()
        .list()
        .await
        .unwrap();
    assert_eq!(priorities(&asc), vec![-3, 0, 4, 4, 10]);
}

#[tokio::test]
async fn test_equal_priorities_are_ordered_by_id() {
    let (mgmt, _) = service();
    for _ in 0..5 {
        create(&mgmt, 1).await;
    }

    let jobs = mgmt
        .create_job_query()
        .order_by_job_priority()
        .desc()
        .list()
        .await
        .unwrap();
    let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted, "ties should break by ascending job id");
}

#[tokio::test]
async fn test_priority_bounds_are_inclusive() {
    let (mgmt, _) = service();
    for p in [1, 2, 3, 4, 5] {
        create(&mgmt, p).await;
    }

    let lower = mgmt
        .create_job_query()
        .priority_lower_than_or_equals(2)
        .order_by_job_priority()
        .asc()
        .list()
        .await
        .unwrap();
    assert_eq!(priorities(&lower), vec![1, 2]);

    let higher = mgmt
        .create_job_query()
        .priority_higher_than_or_equals(4)
        .count()
        .await
        .unwrap();
    assert_eq!(higher, 2);

    let exact = mgmt
        .create_job_query()
        .priority_higher_than_or_equals(3)
        .priority_lower_than_or_equals(3)
        .single_result()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exact.priority, 3);
}

#[tokio::test]
async fn test_contradictory_priority_bounds_match_nothing() {
    let (mgmt, _) = service();
    for p in [1, 2, 3] {
        create(&mgmt, p).await;
    }

    let query = mgmt
        .create_job_query()
        .priority_higher_than_or_equals(3)
        .priority_lower_than_or_equals(2);
    assert!(query.list().await.unwrap().is_empty());
    assert_eq!(query.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_single_result() {
    let (mgmt, _) = service();
    assert!(mgmt
        .create_job_query()
        .single_result()
        .await
        .unwrap()
        .is_none());

    let job = create(&mgmt, 7).await;
    assert_eq!(
        mgmt.create_job_query().single_result().await.unwrap(),
        Some(job.clone())
    );

    create(&mgmt, 7).await;
    create(&mgmt, 7).await;
    let err = mgmt
        .create_job_query()
        .priority_higher_than_or_equals(7)
        .single_result()
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NonUniqueResult(3)));

    let by_id = mgmt
        .create_job_query()
        .job_id(job.id)
        .single_result()
        .await
        .unwrap();
    assert_eq!(by_id.map(|j| j.id), Some(job.id));
}

#[tokio::test]
async fn test_invalid_sorting_usage() {
    let (mgmt, _) = service();
    create(&mgmt, 1).await;

    let missing_direction = mgmt.create_job_query().order_by_job_priority();
    assert!(matches!(
        missing_direction.list().await,
        Err(SchedulerError::InvalidQuery(_))
    ));
    assert!(matches!(
        missing_direction.count().await,
        Err(SchedulerError::InvalidQuery(_))
    ));

    let missing_property = mgmt.create_job_query().desc();
    assert!(matches!(
        missing_property.list().await,
        Err(SchedulerError::InvalidQuery(_))
    ));
}

#[tokio::test]
async fn test_empty_job_id_list_is_rejected() {
    let (mgmt, _) = service();
    let result = mgmt.create_job_query().job_ids(Vec::new()).list().await;
    assert!(matches!(result, Err(SchedulerError::InvalidQuery(_))));
}

#[tokio::test]
async fn test_list_page() {
    let (mgmt, _) = service();
    for p in 0..10 {
        create(&mgmt, p).await;
    }

    let query = mgmt.create_job_query().order_by_job_priority().desc();
    let page = query.list_page(2, 3).await.unwrap();
    assert_eq!(priorities(&page), vec![7, 6, 5]);

    let tail = query.list_page(8, 10).await.unwrap();
    assert_eq!(priorities(&tail), vec![1, 0]);

    assert!(query.list_page(20, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_due_date_filters_and_order() {
    let (mgmt, clock) = service();
    let now = clock.now();

    let undated = create(&mgmt, 0).await;
    let soon = mgmt
        .create_job(
            job_types::TIMER,
            CreationContext::new().due_at(now + Duration::minutes(1)),
        )
        .await
        .unwrap();
    let later = mgmt
        .create_job(
            job_types::TIMER,
            CreationContext::new().due_at(now + Duration::hours(1)),
        )
        .await
        .unwrap();

    let ordered = mgmt
        .create_job_query()
        .order_by_due_date()
        .asc()
        .list()
        .await
        .unwrap();
    let ids: Vec<Uuid> = ordered.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![undated.id, soon.id, later.id]);

    let before = mgmt
        .create_job_query()
        .due_date_lower_than(now + Duration::minutes(30))
        .list()
        .await
        .unwrap();
    assert_eq!(before, vec![soon.clone()]);

    // Strict bound.
    let after = mgmt
        .create_job_query()
        .due_date_higher_than(now + Duration::minutes(1))
        .list()
        .await
        .unwrap();
    assert_eq!(after, vec![later]);

    let executable = mgmt.create_job_query().executable().count().await.unwrap();
    assert_eq!(executable, 1);
}

#[tokio::test]
async fn test_state_filters() {
    let (mgmt, _) = service();
    let pid = Uuid::new_v4();
    let a = mgmt
        .create_job(
            job_types::MESSAGE,
            CreationContext::for_process_instance(pid),
        )
        .await
        .unwrap();
    let b = create(&mgmt, 0).await;
    mgmt.suspend_job(b.id).await.unwrap();

    let suspended = mgmt.create_job_query().suspended().list().await.unwrap();
    assert_eq!(suspended.len(), 1);
    assert_eq!(suspended[0].id, b.id);

    let active = mgmt.create_job_query().active().list().await.unwrap();
    assert_eq!(active, vec![a.clone()]);

    let by_instance = mgmt
        .create_job_query()
        .process_instance_id(pid)
        .job_type(job_types::MESSAGE)
        .list()
        .await
        .unwrap();
    assert_eq!(by_instance, vec![a]);

    assert_eq!(mgmt.create_job_query().locked().count().await.unwrap(), 0);
    assert_eq!(mgmt.create_job_query().not_locked().count().await.unwrap(), 2);
    assert_eq!(mgmt.create_job_query().with_failure().count().await.unwrap(), 0);
    assert_eq!(mgmt.create_job_query().no_retries_left().count().await.unwrap(), 0);
    assert_eq!(
        mgmt.create_job_query()
            .with_retries_left()
            .count()
            .await
            .unwrap(),
        2
    );
}
