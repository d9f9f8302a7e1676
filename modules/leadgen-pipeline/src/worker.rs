//! Dispatch: one work item through the whole pipeline.
//!
//! A worker asks the rate limiter before it claims anything, so a denial
//! leaves the queue untouched. A claimed item always gets exactly one
//! completion report, whatever the fetch did. Records inside a successful
//! fetch are processed independently; one bad record never fails the item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use leadgen_common::{
    EnrichedLead, IcpSignal, LeadStatus, NewRawRecord, PipelineError, PipelinePolicy,
    PipelineResult, RawBusinessRecord, SourceType,
};

use crate::clock::Clock;
use crate::enrichment::EnrichmentService;
use crate::icp::IcpDetector;
use crate::ingestion::IngestionService;
use crate::publisher::{PublishOutcome, Publisher};
use crate::queue::{ClaimedItem, WorkOutcome, WorkQueue};
use crate::rate_limit::{Acquire, RateLimiter};
use crate::scheduling::Scheduler;
use crate::store::{
    LeadStore, ProfileStore, RateLimitStore, RawRecordStore, ScheduleStore, TargetCatalog,
    WorkItemStore,
};
use crate::traits::{EnrichmentProvider, FetchError, FetchTarget, SourceFetcher};

/// Throttle applied when a source says 429 without a `Retry-After`.
const DEFAULT_THROTTLE_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Shared dependency container. Holds the long-lived stores and collaborators;
/// the pipeline services are built from it on demand.
#[derive(Clone, TypedBuilder)]
pub struct PipelineDeps {
    pub raw_records: Arc<dyn RawRecordStore>,
    pub leads: Arc<dyn LeadStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub work_items: Arc<dyn WorkItemStore>,
    pub buckets: Arc<dyn RateLimitStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub targets: Arc<dyn TargetCatalog>,
    pub fetcher: Arc<dyn SourceFetcher>,
    #[builder(default)]
    pub providers: Vec<Arc<dyn EnrichmentProvider>>,
    pub clock: Arc<dyn Clock>,
    #[builder(default)]
    pub policy: PipelinePolicy,
    #[builder(default = Duration::from_secs(30))]
    pub fetch_timeout: Duration,
    #[builder(default = String::from("https://pros.example.com"), setter(into))]
    pub public_base_url: String,
    /// Bucket key within a source; one per upstream account.
    #[builder(default = String::from("default"), setter(into))]
    pub source_key: String,
    /// How long a dispatch may wait on the rate limiter before giving up.
    #[builder(default = Some(Duration::ZERO))]
    pub limiter_max_wait: Option<Duration>,
}

impl PipelineDeps {
    pub fn queue(&self) -> WorkQueue {
        WorkQueue::new(
            self.work_items.clone(),
            self.clock.clone(),
            self.policy.retry.clone(),
        )
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.buckets.clone(),
            self.clock.clone(),
            self.policy.rate_limits.clone(),
            self.policy.default_rate_limits,
        )
    }

    pub fn ingestion(&self) -> IngestionService {
        IngestionService::new(self.raw_records.clone(), self.clock.clone())
    }

    pub fn detector(&self) -> IcpDetector {
        IcpDetector::new(
            self.raw_records.clone(),
            self.clock.clone(),
            self.policy.icp.clone(),
        )
    }

    pub fn enrichment(&self) -> EnrichmentService {
        EnrichmentService::new(
            self.raw_records.clone(),
            self.leads.clone(),
            self.providers.clone(),
            self.clock.clone(),
            self.policy.lead.clone(),
        )
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.leads.clone(),
            self.profiles.clone(),
            self.clock.clone(),
            self.policy.lead.clone(),
            self.public_base_url.clone(),
        )
    }

    pub fn scheduler(&self, queue: Arc<WorkQueue>) -> Scheduler {
        Scheduler::new(
            self.schedules.clone(),
            self.targets.clone(),
            self.work_items.clone(),
            queue,
            self.clock.clone(),
        )
    }

    pub fn worker(&self, queue: Arc<WorkQueue>, limiter: Arc<RateLimiter>) -> Worker {
        Worker {
            queue,
            limiter,
            fetcher: self.fetcher.clone(),
            ingestion: self.ingestion(),
            detector: self.detector(),
            enrichment: self.enrichment(),
            publisher: self.publisher(),
            clock: self.clock.clone(),
            fetch_timeout: self.fetch_timeout,
            source_key: self.source_key.clone(),
            limiter_max_wait: self.limiter_max_wait,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Nothing queued for the source.
    Idle,
    /// The limiter said no; nothing was claimed.
    RateLimited,
    Completed,
    Failed,
    /// The source throttled us mid-dispatch; the item waits without a failure.
    Deferred,
    /// The item moved to a newer attempt before this report landed.
    Stale,
}

impl DispatchStatus {
    /// Whether a drain loop should stop dispatching for this source.
    pub fn ends_drain(&self) -> bool {
        matches!(self, DispatchStatus::Idle | DispatchStatus::RateLimited)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub source_type: SourceType,
    pub status: DispatchStatus,
    pub work_item_id: Option<Uuid>,
    pub attempt: Option<i32>,
    pub retry_after_ms: Option<i64>,
    /// Records the source returned.
    pub records_found: usize,
    pub ingested: usize,
    /// Records that failed validation and never reached the store.
    pub invalid_records: usize,
    pub leads: usize,
    pub published: usize,
    /// Records that failed after ingestion (store errors, enrichment errors).
    pub record_errors: usize,
    pub error: Option<String>,
}

impl DispatchReport {
    fn new(source_type: SourceType, status: DispatchStatus) -> Self {
        Self {
            source_type,
            status,
            work_item_id: None,
            attempt: None,
            retry_after_ms: None,
            records_found: 0,
            ingested: 0,
            invalid_records: 0,
            leads: 0,
            published: 0,
            record_errors: 0,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    queue: Arc<WorkQueue>,
    limiter: Arc<RateLimiter>,
    fetcher: Arc<dyn SourceFetcher>,
    ingestion: IngestionService,
    detector: IcpDetector,
    enrichment: EnrichmentService,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
    source_key: String,
    limiter_max_wait: Option<Duration>,
}

impl Worker {
    /// Dispatch at most one queued item for `source_type`.
    pub async fn run_once(&self, source_type: SourceType) -> PipelineResult<DispatchReport> {
        if !self.queue.has_queued(source_type).await? {
            return Ok(DispatchReport::new(source_type, DispatchStatus::Idle));
        }

        if let Acquire::Denied { retry_after } = self
            .limiter
            .acquire_within(source_type, &self.source_key, self.limiter_max_wait)
            .await?
        {
            debug!(
                source_type = %source_type,
                retry_after_ms = retry_after.num_milliseconds(),
                "Dispatch held back by rate limiter"
            );
            let mut report = DispatchReport::new(source_type, DispatchStatus::RateLimited);
            report.retry_after_ms = Some(retry_after.num_milliseconds());
            return Ok(report);
        }

        let Some(claimed) = self.queue.claim_next(source_type).await? else {
            return Ok(DispatchReport::new(source_type, DispatchStatus::Idle));
        };

        let mut report = DispatchReport::new(source_type, DispatchStatus::Completed);
        report.work_item_id = Some(claimed.id());
        report.attempt = Some(claimed.attempt());

        let outcome = self.fetch_and_process(&claimed, &mut report).await;
        report.status = match &outcome {
            WorkOutcome::Succeeded { .. } => DispatchStatus::Completed,
            WorkOutcome::Deferred { .. } => DispatchStatus::Deferred,
            WorkOutcome::TransientFailure { error }
            | WorkOutcome::TimedOut { error }
            | WorkOutcome::PermanentFailure { error } => {
                report.error = Some(error.clone());
                DispatchStatus::Failed
            }
        };

        match self
            .queue
            .record_result(claimed.id(), claimed.attempt(), outcome)
            .await
        {
            Ok(_) => {}
            Err(PipelineError::StaleCompletion { current, reported }) => {
                warn!(
                    work_item_id = %claimed.id(),
                    current,
                    reported,
                    "Completion arrived after the item was reclaimed"
                );
                report.status = DispatchStatus::Stale;
            }
            Err(e) => return Err(e),
        }
        Ok(report)
    }

    async fn fetch_and_process(
        &self,
        claimed: &ClaimedItem,
        report: &mut DispatchReport,
    ) -> WorkOutcome {
        let key = &claimed.item.key;
        let source_type = key.source_type;
        let target = FetchTarget {
            zip_code: key.zip_code.clone(),
            state: key.state.clone(),
            profession: key.profession.clone(),
        };

        let fetched =
            tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(source_type, &target))
                .await;

        let records = match fetched {
            Ok(Ok(records)) => records,
            Ok(Err(FetchError::RateLimited { retry_after })) => {
                let throttle = retry_after
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_THROTTLE_SECS));
                let noted = self
                    .limiter
                    .on_failure(source_type, &self.source_key, Some(throttle))
                    .await;
                note_bookkeeping(source_type, noted);
                report.retry_after_ms = Some(throttle.num_milliseconds());
                return WorkOutcome::Deferred {
                    retry_at: self.clock.now() + throttle,
                    reason: "source rate limited".to_string(),
                };
            }
            Ok(Err(FetchError::Transient(error))) => {
                let noted = self.limiter.on_failure(source_type, &self.source_key, None).await;
                note_bookkeeping(source_type, noted);
                return WorkOutcome::TransientFailure { error };
            }
            Ok(Err(FetchError::Permanent(error))) => {
                return WorkOutcome::PermanentFailure { error };
            }
            Err(_) => {
                let noted = self.limiter.on_failure(source_type, &self.source_key, None).await;
                note_bookkeeping(source_type, noted);
                return WorkOutcome::TimedOut {
                    error: format!(
                        "fetch exceeded {}ms timeout",
                        self.fetch_timeout.as_millis()
                    ),
                };
            }
        };

        let noted = self.limiter.on_success(source_type, &self.source_key).await;
        note_bookkeeping(source_type, noted);
        report.records_found = records.len();
        self.process_records(records, report).await;

        info!(
            work_item_id = %claimed.id(),
            attempt = claimed.attempt(),
            records_found = report.records_found,
            ingested = report.ingested,
            leads = report.leads,
            published = report.published,
            record_errors = report.record_errors,
            "Dispatch processed"
        );
        WorkOutcome::Succeeded {
            records_found: report.records_found as i32,
        }
    }

    // ---------------------------------------------------------------------------
    // Per-record pipeline
    // ---------------------------------------------------------------------------

    async fn process_records(&self, records: Vec<NewRawRecord>, report: &mut DispatchReport) {
        let mut scored: Vec<(RawBusinessRecord, IcpSignal)> = Vec::with_capacity(records.len());
        for record in records {
            match self.ingest_and_score(record).await {
                Ok(pair) => {
                    report.ingested += 1;
                    scored.push(pair);
                }
                Err(PipelineError::DataValidation(_)) => report.invalid_records += 1,
                Err(e) => {
                    warn!(error = %e, "Record failed before enrichment");
                    report.record_errors += 1;
                }
            }
        }

        for (raw_record_id, result) in self.enrichment.enrich_batch(&scored).await {
            let lead = match result {
                Ok(lead) => lead,
                Err(_) => {
                    report.record_errors += 1;
                    continue;
                }
            };
            report.leads += 1;
            match self.promote(lead).await {
                Ok(true) => report.published += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(raw_record_id = %raw_record_id, error = %e, "Lead promotion failed");
                    report.record_errors += 1;
                }
            }
        }
    }

    async fn ingest_and_score(
        &self,
        record: NewRawRecord,
    ) -> PipelineResult<(RawBusinessRecord, IcpSignal)> {
        let raw = self.ingestion.ingest(record).await?;
        let signal = self.detector.score_record(&raw).await?;
        Ok((raw, signal))
    }

    /// Walk a lead forward as far as it qualifies. Returns whether this call
    /// published a new profile.
    async fn promote(&self, lead: EnrichedLead) -> PipelineResult<bool> {
        let lead = match lead.status {
            LeadStatus::Enriched => self.enrichment.validate(lead.id).await?,
            _ => lead,
        };
        let lead = match lead.status {
            LeadStatus::Validated => self.enrichment.mark_ready(lead.id).await?,
            _ => lead,
        };
        if lead.status != LeadStatus::Ready {
            return Ok(false);
        }
        match self.publisher.publish(lead.id).await {
            Ok(PublishOutcome::Published(_)) => Ok(true),
            Ok(PublishOutcome::AlreadyPublished(_)) => Ok(false),
            Err(PipelineError::NotPublishable(reason)) => {
                debug!(lead_id = %lead.id, reason = %reason, "Lead held back from publishing");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Limiter bookkeeping never decides an item's fate; the claimed item is
/// reported either way.
fn note_bookkeeping(source_type: SourceType, noted: PipelineResult<()>) {
    if let Err(e) = noted {
        warn!(source_type = %source_type, error = %e, "Rate limit bookkeeping failed");
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Runs dispatches for one source with bounded concurrency.
pub struct WorkerPool {
    worker: Arc<Worker>,
    cancel: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self::with_cancel(worker, Arc::new(AtomicBool::new(false)))
    }

    pub fn with_cancel(worker: Arc<Worker>, cancel: Arc<AtomicBool>) -> Self {
        Self { worker, cancel }
    }

    /// Set it to stop every drain on this pool after in-flight dispatches finish.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Dispatch until the source has nothing queued or the limiter denies,
    /// with at most `concurrency` dispatches in flight and `delay` between
    /// starting consecutive ones.
    pub async fn drain(
        &self,
        source_type: SourceType,
        concurrency: usize,
        delay: Duration,
    ) -> PipelineResult<Vec<DispatchReport>> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        while !self.cancel.load(Ordering::Relaxed) && !stop.load(Ordering::Relaxed) {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Store(e.into()))?;
            if self.cancel.load(Ordering::Relaxed) || stop.load(Ordering::Relaxed) {
                break;
            }

            let worker = self.worker.clone();
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = worker.run_once(source_type).await;
                match &result {
                    Ok(report) if report.status.ends_drain() => stop.store(true, Ordering::Relaxed),
                    Ok(_) => {}
                    Err(_) => stop.store(true, Ordering::Relaxed),
                }
                result
            }));

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let mut reports = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    error!(source_type = %source_type, error = %e, "Dispatch failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(source_type = %source_type, error = %e, "Dispatch task panicked");
                    first_error.get_or_insert(PipelineError::Store(e.into()));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let completed = reports
            .iter()
            .filter(|r| r.status == DispatchStatus::Completed)
            .count();
        info!(
            source_type = %source_type,
            dispatched = reports.len(),
            completed,
            "Drain finished"
        );
        Ok(reports)
    }
}
