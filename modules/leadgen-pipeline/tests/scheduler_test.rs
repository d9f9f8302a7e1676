//! Schedule evaluation: due checks, windows, strategies and advancement.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveTime, TimeZone, Utc};
use uuid::Uuid;

use leadgen_common::{
    NewWorkItem, RetryPolicy, ScrapeSchedule, SelectionStrategy, SourceType, TargetSelector,
    WorkStatus,
};
use leadgen_pipeline::clock::Clock;
use leadgen_pipeline::queue::{WorkOutcome, WorkQueue};
use leadgen_pipeline::scheduling::{Scheduler, TickStatus};
use leadgen_pipeline::store::{MemoryStore, ScheduleStore, StaticTargets};
use leadgen_pipeline::testing::{noon, schedule, target, work_item, work_key, ManualClock};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    queue: Arc<WorkQueue>,
    scheduler: Scheduler,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::at_noon());
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(WorkQueue::new(
        store.clone(),
        clock.clone(),
        RetryPolicy::default(),
    ));
    let targets = Arc::new(StaticTargets::new(vec![
        target("78701", "TX", 1),
        target("78702", "TX", 9),
        target("78703", "TX", 5),
        target("87101", "NM", 7),
    ]));
    let scheduler = Scheduler::new(
        store.clone(),
        targets,
        store.clone(),
        queue.clone(),
        clock.clone(),
    );
    Harness {
        clock,
        store,
        queue,
        scheduler,
    }
}

async fn insert(h: &Harness, schedule: ScrapeSchedule) -> ScrapeSchedule {
    h.store.insert_schedule(schedule.clone()).await.unwrap();
    schedule
}

async fn queued_zips(queue: &WorkQueue) -> Vec<String> {
    let mut zips = Vec::new();
    while let Some(claimed) = queue.claim_next(SourceType::GoogleMaps).await.unwrap() {
        zips.push(claimed.item.key.zip_code.clone());
    }
    zips
}

/// Schedule reads fail until `failures` runs out, then pass through.
struct FlakySchedules {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
    reads: AtomicUsize,
}

#[async_trait]
impl ScheduleStore for FlakySchedules {
    async fn insert_schedule(&self, schedule: ScrapeSchedule) -> anyhow::Result<()> {
        self.inner.insert_schedule(schedule).await
    }

    async fn get_schedule(&self, id: Uuid) -> anyhow::Result<Option<ScrapeSchedule>> {
        self.inner.get_schedule(id).await
    }

    async fn all_schedules(&self) -> anyhow::Result<Vec<ScrapeSchedule>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection refused");
        }
        self.inner.all_schedules().await
    }

    async fn update_schedule(
        &self,
        schedule: &ScrapeSchedule,
        expected_version: i64,
    ) -> anyhow::Result<bool> {
        self.inner.update_schedule(schedule, expected_version).await
    }
}

async fn fail_item(queue: &WorkQueue, outcome: WorkOutcome) {
    let claimed = queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();
    queue
        .record_result(claimed.id(), claimed.attempt(), outcome)
        .await
        .unwrap();
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn priority_strategy_takes_top_targets_and_advances() {
    let h = harness();
    let mut s = schedule("tx-priority", SelectionStrategy::Priority, noon());
    s.zip_limit_per_run = 2;
    s.target = TargetSelector {
        states: vec!["tx".into()],
        zip_codes: vec![],
    };
    let s = insert(&h, s).await;

    let report = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(report.status, TickStatus::Ran);
    assert_eq!(report.source_type, SourceType::GoogleMaps);
    assert_eq!(report.selected, 2);
    assert_eq!(report.enqueued, 2);
    assert_eq!(report.next_run_at, noon() + Duration::hours(24));
    assert_eq!(report.max_concurrent, 2);

    let stored = h.store.get_schedule(s.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_at, noon() + Duration::hours(24));
    assert_eq!(stored.last_run_at, Some(noon()));
    assert_eq!(stored.last_run_enqueued, 2);
    assert!(stored.last_error.is_none());

    let again = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(again.status, TickStatus::NotDue);

    assert_eq!(queued_zips(&h.queue).await, vec!["78702", "78703"]);
}

#[tokio::test]
async fn all_strategy_with_zero_limit_takes_everything_matching() {
    let h = harness();
    let s = insert(&h, schedule("everywhere", SelectionStrategy::All, noon())).await;

    let report = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(report.enqueued, 4);

    // The next slot re-selects the same keys; nothing new is queued.
    h.clock.advance(Duration::hours(24));
    let report = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(report.status, TickStatus::Ran);
    assert_eq!(report.enqueued, 0);
    assert_eq!(report.already_present, 4);
}

#[tokio::test]
async fn random_sample_respects_the_limit() {
    let h = harness();
    let mut s = schedule("sample", SelectionStrategy::RandomSample, noon());
    s.zip_limit_per_run = 3;
    let s = insert(&h, s).await;

    let report = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(report.selected, 3);
    assert_eq!(report.enqueued, 3);
}

#[tokio::test]
async fn outside_window_or_weekday_does_not_run() {
    let h = harness();
    let mut business_hours = schedule("business-hours", SelectionStrategy::All, noon());
    business_hours.start_time = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
    business_hours.end_time = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
    let business_hours = insert(&h, business_hours).await;

    let mut weekends = schedule("weekends", SelectionStrategy::All, noon());
    weekends.allowed_weekdays = vec![chrono::Weekday::Sat, chrono::Weekday::Sun];
    let weekends = insert(&h, weekends).await;

    h.clock.set(Utc.with_ymd_and_hms(2026, 3, 4, 20, 0, 0).unwrap());
    let report = h.scheduler.run_schedule_tick(business_hours.id).await.unwrap();
    assert_eq!(report.status, TickStatus::OutsideWindow);
    let stored = h.store.get_schedule(business_hours.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_at, noon());

    // 2026-03-04 is a Wednesday.
    let report = h.scheduler.run_schedule_tick(weekends.id).await.unwrap();
    assert_eq!(report.status, TickStatus::OutsideWindow);

    h.clock.set(Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap());
    let report = h.scheduler.run_schedule_tick(weekends.id).await.unwrap();
    assert_eq!(report.status, TickStatus::Ran);
}

#[tokio::test]
async fn disabled_schedule_is_skipped() {
    let h = harness();
    let mut s = schedule("paused", SelectionStrategy::All, noon());
    s.enabled = false;
    let s = insert(&h, s).await;

    let report = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(report.status, TickStatus::Disabled);
    assert_eq!(report.enqueued, 0);
}

#[tokio::test]
async fn failed_strategy_requeues_retryable_failures_only() {
    let h = harness();
    h.queue.enqueue(work_item("78701", 0)).await.unwrap();
    h.queue.enqueue(work_item("78702", 0)).await.unwrap();

    let first = h.queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();
    h.queue
        .record_result(
            first.id(),
            first.attempt(),
            WorkOutcome::TransientFailure {
                error: "502 from source".into(),
            },
        )
        .await
        .unwrap();
    let second = h.queue.claim_next(SourceType::GoogleMaps).await.unwrap().unwrap();
    h.queue
        .record_result(
            second.id(),
            second.attempt(),
            WorkOutcome::PermanentFailure {
                error: "unknown zip".into(),
            },
        )
        .await
        .unwrap();

    h.clock.advance(Duration::hours(2));
    let s = insert(
        &h,
        schedule("retry-failed", SelectionStrategy::Failed, noon()),
    )
    .await;
    let report = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.enqueued, 1);

    let retried = h.queue.get(first.id()).await.unwrap();
    assert_eq!(retried.status, WorkStatus::Queued);
    let parked = h.queue.get(second.id()).await.unwrap();
    assert_eq!(parked.status, WorkStatus::Failed);
}

#[tokio::test]
async fn recurrence_rule_sets_the_next_run() {
    let h = harness();
    let mut s = schedule("mornings", SelectionStrategy::All, noon());
    s.recurrence = Some("DTSTART:20260301T060000Z\nRRULE:FREQ=DAILY".into());
    let s = insert(&h, s).await;

    let report = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(report.status, TickStatus::Ran);
    assert_eq!(
        report.next_run_at,
        Utc.with_ymd_and_hms(2026, 3, 5, 6, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn concurrent_ticks_run_a_slot_once() {
    let h = harness();
    let s = insert(&h, schedule("contended", SelectionStrategy::All, noon())).await;

    let (a, b) = tokio::join!(
        h.scheduler.run_schedule_tick(s.id),
        h.scheduler.run_schedule_tick(s.id)
    );
    let statuses = [a.unwrap().status, b.unwrap().status];
    assert_eq!(
        statuses.iter().filter(|s| **s == TickStatus::Ran).count(),
        1
    );
    assert!(statuses
        .iter()
        .all(|s| matches!(s, TickStatus::Ran | TickStatus::NotDue | TickStatus::LostRace)));
    assert_eq!(queued_zips(&h.queue).await.len(), 4);
}

#[tokio::test]
async fn tick_all_reports_every_schedule() {
    let h = harness();
    insert(&h, schedule("due", SelectionStrategy::All, noon())).await;
    insert(
        &h,
        schedule("later", SelectionStrategy::All, noon() + Duration::hours(1)),
    )
    .await;

    let reports = h.scheduler.tick_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(
        reports.iter().filter(|r| r.status == TickStatus::Ran).count(),
        1
    );
    assert_eq!(
        reports.iter().filter(|r| r.status == TickStatus::NotDue).count(),
        1
    );
}

#[tokio::test]
async fn failed_strategy_sees_past_terminal_failures_and_other_professions() {
    let h = harness();
    for n in 0..1_200 {
        h.queue.enqueue(work_item(&format!("7{n:04}"), 0)).await.unwrap();
        fail_item(
            &h.queue,
            WorkOutcome::PermanentFailure {
                error: "unknown zip".into(),
            },
        )
        .await;
    }
    h.queue
        .enqueue(NewWorkItem {
            key: work_key(SourceType::GoogleMaps, "78701", "electrician"),
            priority: 9,
        })
        .await
        .unwrap();
    fail_item(
        &h.queue,
        WorkOutcome::TransientFailure {
            error: "502 from source".into(),
        },
    )
    .await;
    h.clock.advance(Duration::seconds(1));
    h.queue.enqueue(work_item("78702", 0)).await.unwrap();
    fail_item(
        &h.queue,
        WorkOutcome::TransientFailure {
            error: "502 from source".into(),
        },
    )
    .await;

    h.clock.advance(Duration::hours(2));
    let s = insert(
        &h,
        schedule("retry-failed", SelectionStrategy::Failed, h.clock.now()),
    )
    .await;
    let report = h.scheduler.run_schedule_tick(s.id).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.enqueued, 1);
    assert_eq!(queued_zips(&h.queue).await, vec!["78702".to_string()]);
}

#[tokio::test]
async fn run_loop_survives_a_failed_tick() {
    let clock = Arc::new(ManualClock::at_noon());
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(WorkQueue::new(
        store.clone(),
        clock.clone(),
        RetryPolicy::default(),
    ));
    let schedules = Arc::new(FlakySchedules {
        inner: store.clone(),
        failures: AtomicUsize::new(1),
        reads: AtomicUsize::new(0),
    });
    let targets = Arc::new(StaticTargets::new(vec![target("78701", "TX", 1)]));
    let scheduler = Arc::new(Scheduler::new(
        schedules.clone(),
        targets,
        store.clone(),
        queue.clone(),
        clock,
    ));
    let s = schedule("nightly", SelectionStrategy::All, noon());
    store.insert_schedule(s.clone()).await.unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let running = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move {
            scheduler
                .run(
                    std::time::Duration::from_millis(10),
                    Duration::minutes(15),
                    cancel,
                )
                .await
        }
    });

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while schedules.reads.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("loop kept ticking after the failed read");
    cancel.store(true, Ordering::Relaxed);

    running.await.unwrap().unwrap();
    let stored = store.get_schedule(s.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_at, noon() + Duration::hours(24));
    assert_eq!(queued_zips(&queue).await, vec!["78701".to_string()]);
}
