//! Work queue lifecycle against the in-memory store.
//!
//! Run with: cargo test -p leadgen-pipeline --test queue_test

use std::sync::Arc;

use chrono::Duration;

use uuid::Uuid;

use leadgen_common::{
    MessageResult, PipelineError, QueueMessage, RetryPolicy, SourceType, WorkStatus,
};
use leadgen_pipeline::queue::{EnqueueOutcome, WorkOutcome, WorkQueue};
use leadgen_pipeline::store::{MemoryStore, WorkItemStore};
use leadgen_pipeline::testing::{noon, work_item, ManualClock};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn setup() -> (Arc<ManualClock>, WorkQueue) {
    let clock = Arc::new(ManualClock::at_noon());
    let queue = WorkQueue::new(
        Arc::new(MemoryStore::new()),
        clock.clone(),
        RetryPolicy::default(),
    );
    (clock, queue)
}

/// Past the longest possible backoff, jitter included.
fn past_backoff() -> Duration {
    Duration::hours(2)
}

async fn fail_once(queue: &WorkQueue, clock: &ManualClock) -> Uuid {
    let claimed = queue
        .claim_next(SourceType::GoogleMaps)
        .await
        .unwrap()
        .expect("an item should be queued");
    queue
        .record_result(
            claimed.id(),
            claimed.attempt(),
            WorkOutcome::TransientFailure {
                error: "connection reset".into(),
            },
        )
        .await
        .unwrap();
    clock.advance(past_backoff());
    claimed.id()
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn enqueue_is_idempotent_on_key() {
    let (_clock, queue) = setup();

    let first = queue.enqueue(work_item("78701", 3)).await.unwrap();
    let second = queue.enqueue(work_item("78701", 3)).await.unwrap();

    assert!(matches!(first, EnqueueOutcome::Created(_)));
    assert!(matches!(second, EnqueueOutcome::AlreadyPresent(_)));
    assert_eq!(first.item().id, second.item().id);
    assert_eq!(first.item().status, WorkStatus::Queued);
    assert_eq!(first.item().queued_at, Some(noon()));
}

#[tokio::test]
async fn claims_follow_priority_then_age() {
    let (clock, queue) = setup();
    queue.enqueue(work_item("78701", 1)).await.unwrap();
    clock.advance(Duration::seconds(1));
    queue.enqueue(work_item("78702", 5)).await.unwrap();
    clock.advance(Duration::seconds(1));
    queue.enqueue(work_item("78703", 5)).await.unwrap();

    let mut order = Vec::new();
    while let Some(claimed) = queue.claim_next(SourceType::GoogleMaps).await.unwrap() {
        assert_eq!(claimed.attempt(), 1);
        assert_eq!(claimed.item.status, WorkStatus::Processing);
        order.push(claimed.item.key.zip_code.clone());
    }
    assert_eq!(order, vec!["78702", "78703", "78701"]);
    assert!(queue.claim_next(SourceType::Yelp).await.unwrap().is_none());
}

#[tokio::test]
async fn completed_item_stays_completed_on_reenqueue() {
    let (_clock, queue) = setup();
    queue.enqueue(work_item("78701", 0)).await.unwrap();
    let claimed = queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();
    let done = queue
        .record_result(
            claimed.id(),
            claimed.attempt(),
            WorkOutcome::Succeeded { records_found: 12 },
        )
        .await
        .unwrap();
    assert_eq!(done.status, WorkStatus::Completed);
    assert_eq!(done.records_found, 12);

    let again = queue.enqueue(work_item("78701", 0)).await.unwrap();
    assert!(matches!(again, EnqueueOutcome::AlreadyPresent(_)));
    assert_eq!(again.item().status, WorkStatus::Completed);
}

#[tokio::test]
async fn transient_failures_exhaust_into_review_with_message_chain() {
    let (clock, queue) = setup();
    queue.enqueue(work_item("78701", 0)).await.unwrap();

    let mut item_id = None;
    for round in 1..=5 {
        let id = fail_once(&queue, &clock).await;
        item_id = Some(id);
        let requeued = queue.requeue_due().await.unwrap();
        if round < 5 {
            assert_eq!(requeued, 1, "round {round} should requeue");
        } else {
            assert_eq!(requeued, 0, "exhausted item must not requeue");
        }
    }
    let item_id = item_id.unwrap();

    let item = queue.get(item_id).await.unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    assert_eq!(item.consecutive_failures, 5);
    assert_eq!(item.attempt, 5);
    assert!(item.next_retry_at.is_none());

    let review = queue.needs_review().await.unwrap();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].id, item_id);

    let again = queue.enqueue(work_item("78701", 0)).await.unwrap();
    assert!(matches!(again, EnqueueOutcome::AlreadyPresent(_)));

    let messages = queue.messages(item_id).await.unwrap();
    assert_eq!(messages.len(), 5);
    assert!(messages[0].retry_of.is_none());
    for pair in messages.windows(2) {
        assert_eq!(pair[1].retry_of, Some(pair[0].id));
        assert_eq!(pair[1].attempt, pair[0].attempt + 1);
    }
    assert!(messages.iter().all(|m| m.result == MessageResult::Failed));
    assert_eq!(messages[4].error.as_deref(), Some("connection reset"));
}

#[tokio::test]
async fn permanent_failure_is_never_retried() {
    let (clock, queue) = setup();
    queue.enqueue(work_item("00000", 0)).await.unwrap();
    let claimed = queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();
    let item = queue
        .record_result(
            claimed.id(),
            claimed.attempt(),
            WorkOutcome::PermanentFailure {
                error: "unknown zip".into(),
            },
        )
        .await
        .unwrap();
    assert!(item.permanent_failure);
    assert!(!item.has_retries_left());

    clock.advance(past_backoff());
    assert_eq!(queue.requeue_due().await.unwrap(), 0);
    assert_eq!(queue.needs_review().await.unwrap().len(), 1);

    let messages = queue.messages(claimed.id()).await.unwrap();
    assert_eq!(messages[0].result, MessageResult::PermanentFailure);
}

#[tokio::test]
async fn deferral_parks_without_counting_a_failure() {
    let (clock, queue) = setup();
    queue.enqueue(work_item("78701", 0)).await.unwrap();
    let claimed = queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();

    let retry_at = noon() + Duration::minutes(10);
    let item = queue
        .record_result(
            claimed.id(),
            claimed.attempt(),
            WorkOutcome::Deferred {
                retry_at,
                reason: "source rate limited".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    assert_eq!(item.consecutive_failures, 0);
    assert_eq!(item.next_retry_at, Some(retry_at));

    clock.advance(Duration::minutes(5));
    assert_eq!(queue.requeue_due().await.unwrap(), 0);

    clock.advance(Duration::minutes(5));
    assert_eq!(queue.requeue_due().await.unwrap(), 1);
    let item = queue.get(claimed.id()).await.unwrap();
    assert_eq!(item.status, WorkStatus::Queued);

    let messages = queue.messages(claimed.id()).await.unwrap();
    assert_eq!(messages[0].result, MessageResult::Deferred);
}

#[tokio::test]
async fn late_report_after_reclaim_is_stale() {
    let (clock, queue) = setup();
    queue.enqueue(work_item("78701", 0)).await.unwrap();
    let first = queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();

    clock.advance(Duration::minutes(10));
    assert_eq!(queue.reclaim_stuck(Duration::minutes(15)).await.unwrap(), 0);

    clock.advance(Duration::minutes(10));
    assert_eq!(queue.reclaim_stuck(Duration::minutes(15)).await.unwrap(), 1);
    let reclaimed = queue.get(first.id()).await.unwrap();
    assert_eq!(reclaimed.status, WorkStatus::Failed);
    assert_eq!(reclaimed.consecutive_failures, 1);

    // Same attempt, but the item already failed under it.
    let late = queue
        .record_result(
            first.id(),
            first.attempt(),
            WorkOutcome::Succeeded { records_found: 3 },
        )
        .await;
    assert!(matches!(late, Err(PipelineError::StaleCompletion { .. })));

    clock.advance(past_backoff());
    queue.requeue_due().await.unwrap();
    let second = queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();
    assert_eq!(second.attempt(), 2);

    let late = queue
        .record_result(
            first.id(),
            first.attempt(),
            WorkOutcome::Succeeded { records_found: 3 },
        )
        .await;
    match late {
        Err(PipelineError::StaleCompletion { current, reported }) => {
            assert_eq!(current, 2);
            assert_eq!(reported, 1);
        }
        other => panic!("expected stale completion, got {other:?}"),
    }

    let item = queue.get(first.id()).await.unwrap();
    assert_eq!(item.status, WorkStatus::Processing);
    let messages = queue.messages(first.id()).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].result, MessageResult::TimedOut);
}

#[tokio::test]
async fn due_retry_is_found_behind_a_wall_of_terminal_failures() {
    let (clock, queue) = setup();
    for n in 0..500 {
        queue.enqueue(work_item(&format!("7{n:04}"), 0)).await.unwrap();
        let claimed = queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();
        queue
            .record_result(
                claimed.id(),
                claimed.attempt(),
                WorkOutcome::PermanentFailure {
                    error: "unknown zip".into(),
                },
            )
            .await
            .unwrap();
    }

    clock.advance(Duration::seconds(1));
    queue.enqueue(work_item("79999", 0)).await.unwrap();
    let retryable = fail_once(&queue, &clock).await;

    assert_eq!(queue.requeue_due().await.unwrap(), 1);
    assert_eq!(queue.get(retryable).await.unwrap().status, WorkStatus::Queued);
    assert_eq!(queue.needs_review().await.unwrap().len(), 500);
}

#[tokio::test]
async fn stale_completion_write_appends_no_message() {
    let clock = Arc::new(ManualClock::at_noon());
    let store = Arc::new(MemoryStore::new());
    let queue = WorkQueue::new(store.clone(), clock.clone(), RetryPolicy::default());
    queue.enqueue(work_item("78701", 0)).await.unwrap();
    let claimed = queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();

    let mut finished = claimed.item.clone();
    finished.status = WorkStatus::Completed;
    finished.completed_at = Some(noon());
    let message = QueueMessage {
        id: Uuid::new_v4(),
        work_item_id: finished.id,
        attempt: finished.attempt,
        source_type: SourceType::GoogleMaps,
        dispatched_at: noon(),
        finished_at: noon(),
        duration_ms: 0,
        result: MessageResult::Succeeded,
        records_found: 0,
        error: None,
        retry_of: None,
    };

    let stale = finished.version + 1;
    assert!(!store
        .complete_attempt(&finished, stale, message.clone())
        .await
        .unwrap());
    assert!(store.messages_for(finished.id).await.unwrap().is_empty());
    assert_eq!(
        queue.get(finished.id).await.unwrap().status,
        WorkStatus::Processing
    );

    assert!(store
        .complete_attempt(&finished, finished.version, message)
        .await
        .unwrap());
    assert_eq!(store.messages_for(finished.id).await.unwrap().len(), 1);
    let stored = queue.get(finished.id).await.unwrap();
    assert_eq!(stored.status, WorkStatus::Completed);
    assert_eq!(stored.version, finished.version + 1);
}
