use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use leadgen_common::{
    NewWorkItem, PipelineError, PipelineResult, ScrapeSchedule, SelectionStrategy, SourceType,
    WorkItemKey,
};

use super::calendar;
use crate::clock::Clock;
use crate::queue::{EnqueueOutcome, WorkQueue};
use crate::store::{RetryScope, ScheduleStore, TargetCatalog, WorkItemStore};

const MAX_CAS_ATTEMPTS: usize = 8;

/// Upper bound on items the `failed` strategy re-enqueues per run.
const FAILED_SCAN_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    Ran,
    Disabled,
    NotDue,
    OutsideWindow,
    /// Another scheduler advanced the schedule first.
    LostRace,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub schedule_id: Uuid,
    pub source_type: SourceType,
    pub status: TickStatus,
    pub selected: usize,
    pub enqueued: usize,
    pub already_present: usize,
    pub next_run_at: DateTime<Utc>,
    pub error: Option<String>,
    /// Dispatch bounds the hosting process applies when draining this run's work.
    pub max_concurrent: u32,
    pub delay_between_requests_ms: u64,
}

impl TickReport {
    fn for_schedule(schedule: &ScrapeSchedule, status: TickStatus) -> Self {
        Self {
            schedule_id: schedule.id,
            source_type: schedule.source_type,
            status,
            selected: 0,
            enqueued: 0,
            already_present: 0,
            next_run_at: schedule.next_run_at,
            error: None,
            max_concurrent: schedule.max_concurrent,
            delay_between_requests_ms: schedule.delay_between_requests_ms,
        }
    }
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    targets: Arc<dyn TargetCatalog>,
    items: Arc<dyn WorkItemStore>,
    queue: Arc<WorkQueue>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        targets: Arc<dyn TargetCatalog>,
        items: Arc<dyn WorkItemStore>,
        queue: Arc<WorkQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            schedules,
            targets,
            items,
            queue,
            clock,
        }
    }

    /// Evaluate one schedule. `next_run_at` moves before any work is enqueued,
    /// so a failing run never stalls the schedule and two schedulers never
    /// both run the same slot.
    pub async fn run_schedule_tick(&self, schedule_id: Uuid) -> PipelineResult<TickReport> {
        let schedule = self
            .schedules
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("schedule {schedule_id}")))?;

        if !schedule.enabled {
            return Ok(TickReport::for_schedule(&schedule, TickStatus::Disabled));
        }
        let now = self.clock.now();
        if now < schedule.next_run_at {
            return Ok(TickReport::for_schedule(&schedule, TickStatus::NotDue));
        }
        if !calendar::in_window(&schedule, now) {
            return Ok(TickReport::for_schedule(&schedule, TickStatus::OutsideWindow));
        }

        let expected = schedule.version;
        let mut advanced = schedule.clone();
        advanced.next_run_at = calendar::next_run_at(&schedule, now);
        advanced.last_run_at = Some(now);
        if !self.schedules.update_schedule(&advanced, expected).await? {
            return Ok(TickReport::for_schedule(&schedule, TickStatus::LostRace));
        }
        advanced.version = expected + 1;

        let mut report = TickReport::for_schedule(&advanced, TickStatus::Ran);

        match self.select(&advanced).await {
            Ok(batch) => {
                report.selected = batch.len();
                for item in batch {
                    match self.queue.enqueue(item).await {
                        Ok(EnqueueOutcome::AlreadyPresent(_)) => report.already_present += 1,
                        Ok(_) => report.enqueued += 1,
                        Err(e) => {
                            warn!(schedule_id = %schedule_id, error = %e, "Enqueue failed during schedule run");
                            report.error.get_or_insert_with(|| e.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                error!(schedule_id = %schedule_id, error = %e, "Target selection failed");
                report.error = Some(e.to_string());
            }
        }

        self.record_run(schedule_id, &report).await?;
        info!(
            schedule_id = %schedule_id,
            name = %advanced.name,
            strategy = %advanced.strategy,
            selected = report.selected,
            enqueued = report.enqueued,
            already_present = report.already_present,
            next_run_at = %report.next_run_at,
            "Schedule ran"
        );
        Ok(report)
    }

    /// Tick every schedule. One schedule failing does not stop the others.
    pub async fn tick_all(&self) -> PipelineResult<Vec<TickReport>> {
        let schedules = self.schedules.all_schedules().await?;
        let mut reports = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            match self.run_schedule_tick(schedule.id).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(schedule_id = %schedule.id, error = %e, "Schedule tick failed"),
            }
        }
        Ok(reports)
    }

    /// Tick, fail items stuck in `processing` past `stuck_after`, requeue due
    /// retries, sleep; until `cancel` is set. A failed step is logged and the
    /// loop carries on with the next one.
    pub async fn run(
        &self,
        tick: Duration,
        stuck_after: chrono::Duration,
        cancel: Arc<AtomicBool>,
    ) -> PipelineResult<()> {
        info!(tick_secs = tick.as_secs(), "Scheduler loop started");
        while !cancel.load(Ordering::Relaxed) {
            let ran = match self.tick_all().await {
                Ok(reports) => reports.iter().filter(|r| r.status == TickStatus::Ran).count(),
                Err(e) => {
                    error!(error = %e, "Scheduler tick failed");
                    0
                }
            };
            let reclaimed = self.queue.reclaim_stuck(stuck_after).await.unwrap_or_else(|e| {
                error!(error = %e, "Reclaiming stuck work items failed");
                0
            });
            let requeued = self.queue.requeue_due().await.unwrap_or_else(|e| {
                error!(error = %e, "Requeueing due work items failed");
                0
            });
            if ran > 0 || reclaimed > 0 || requeued > 0 {
                info!(ran, reclaimed, requeued, "Scheduler tick");
            }
            tokio::time::sleep(tick).await;
        }
        info!("Scheduler loop stopped");
        Ok(())
    }

    async fn record_run(&self, schedule_id: Uuid, report: &TickReport) -> PipelineResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.schedules.get_schedule(schedule_id).await? else {
                return Err(PipelineError::NotFound(format!("schedule {schedule_id}")));
            };
            let expected = current.version;
            let mut updated = current;
            updated.last_run_enqueued = report.enqueued as i32;
            updated.last_error = report.error.clone();
            if self.schedules.update_schedule(&updated, expected).await? {
                return Ok(());
            }
        }
        Err(PipelineError::Conflict(format!(
            "schedule {schedule_id} kept changing while recording its run"
        )))
    }

    // ---------------------------------------------------------------------------
    // Target selection
    // ---------------------------------------------------------------------------

    /// Up to `zip_limit_per_run` items (0 means no limit) chosen by the strategy.
    async fn select(&self, schedule: &ScrapeSchedule) -> PipelineResult<Vec<NewWorkItem>> {
        let limit = match schedule.zip_limit_per_run {
            0 => usize::MAX,
            n => n as usize,
        };
        let key = |zip_code: &str, state: &str| WorkItemKey {
            zip_code: zip_code.to_string(),
            state: state.to_string(),
            source_type: schedule.source_type,
            profession: schedule.profession.clone(),
        };

        if schedule.strategy == SelectionStrategy::Failed {
            let scope = RetryScope {
                source_type: Some(schedule.source_type),
                profession: Some(schedule.profession.clone()),
                target: schedule.target.clone(),
            };
            let mut failed = self
                .items
                .due_retries(&scope, self.clock.now(), limit.min(FAILED_SCAN_LIMIT))
                .await?;
            failed.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.key.zip_code.cmp(&b.key.zip_code))
            });
            return Ok(failed
                .into_iter()
                .map(|i| NewWorkItem {
                    key: i.key,
                    priority: i.priority,
                })
                .collect());
        }

        let mut targets = self.targets.targets(&schedule.target).await?;
        match schedule.strategy {
            SelectionStrategy::All => targets.sort_by(|a, b| a.zip_code.cmp(&b.zip_code)),
            SelectionStrategy::Priority => targets.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.zip_code.cmp(&b.zip_code))
            }),
            SelectionStrategy::RandomSample => targets.shuffle(&mut rand::rng()),
            SelectionStrategy::Failed => {}
        }
        Ok(targets
            .into_iter()
            .take(limit)
            .map(|t| NewWorkItem {
                key: key(&t.zip_code, &t.state),
                priority: schedule.priority + t.priority,
            })
            .collect())
    }
}
