//! Read-only operational views for monitoring.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use leadgen_common::{
    PipelineResult, RateWindow, SelectionStrategy, SourceType,
};

use crate::rate_limit::window;
use crate::store::{QueueSummaryRow, RateLimitStore, ScheduleStore, WorkItemStore};

pub type QueueHealthRow = QueueSummaryRow;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub window: RateWindow,
    pub used: u32,
    pub limit: Option<u32>,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatusRow {
    pub source_type: SourceType,
    pub source_key: String,
    pub windows: Vec<WindowUsage>,
    pub is_throttled: bool,
    pub throttled_until: Option<DateTime<Utc>>,
    pub consecutive_errors: i32,
    pub total_requests: i64,
    pub last_request_at: Option<DateTime<Utc>>,
    /// Whether a request made now would be allowed.
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleStatusRow {
    pub schedule_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub source_type: SourceType,
    pub profession: String,
    pub strategy: SelectionStrategy,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_enqueued: i32,
    pub last_error: Option<String>,
    pub due: bool,
}

/// Everything `leadgen status` prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub queue_health: Vec<QueueHealthRow>,
    pub rate_limit_status: Vec<RateLimitStatusRow>,
    pub schedule_status: Vec<ScheduleStatusRow>,
}

pub async fn queue_health(store: &dyn WorkItemStore) -> PipelineResult<Vec<QueueHealthRow>> {
    Ok(store.queue_summary().await?)
}

/// Buckets as they would look at `now`; expired windows read as empty.
pub async fn rate_limit_status(
    store: &dyn RateLimitStore,
    now: DateTime<Utc>,
) -> PipelineResult<Vec<RateLimitStatusRow>> {
    let buckets = store.all_buckets().await?;
    Ok(buckets
        .into_iter()
        .map(|mut bucket| {
            window::roll_windows(&mut bucket, now);
            let available = window::evaluate(&bucket, now) == window::Decision::Allow;
            RateLimitStatusRow {
                windows: RateWindow::ALL
                    .iter()
                    .map(|w| WindowUsage {
                        window: *w,
                        used: bucket.counter(*w).count,
                        limit: bucket.limits.limit(*w),
                        resets_at: bucket.counter(*w).reset_at,
                    })
                    .collect(),
                source_type: bucket.source_type,
                source_key: bucket.source_key,
                is_throttled: bucket.is_throttled,
                throttled_until: bucket.throttled_until,
                consecutive_errors: bucket.consecutive_errors,
                total_requests: bucket.total_requests,
                last_request_at: bucket.last_request_at,
                available,
            }
        })
        .collect())
}

pub async fn schedule_status(
    store: &dyn ScheduleStore,
    now: DateTime<Utc>,
) -> PipelineResult<Vec<ScheduleStatusRow>> {
    let schedules = store.all_schedules().await?;
    Ok(schedules
        .into_iter()
        .map(|s| ScheduleStatusRow {
            due: s.enabled && now >= s.next_run_at,
            schedule_id: s.id,
            name: s.name,
            enabled: s.enabled,
            source_type: s.source_type,
            profession: s.profession,
            strategy: s.strategy,
            next_run_at: s.next_run_at,
            last_run_at: s.last_run_at,
            last_run_enqueued: s.last_run_enqueued,
            last_error: s.last_error,
        })
        .collect())
}

pub async fn status_report(
    items: &dyn WorkItemStore,
    buckets: &dyn RateLimitStore,
    schedules: &dyn ScheduleStore,
    now: DateTime<Utc>,
) -> PipelineResult<StatusReport> {
    Ok(StatusReport {
        generated_at: now,
        queue_health: queue_health(items).await?,
        rate_limit_status: rate_limit_status(buckets, now).await?,
        schedule_status: schedule_status(schedules, now).await?,
    })
}
