//! Durable, retryable work queue over [`WorkItemStore`].
//!
//! Every mutation is a read → transition → compare-and-set cycle, so any number
//! of worker processes can share one store. A claim bumps the item's attempt
//! counter; completion reports carry it back and are refused when the item has
//! since moved to a newer attempt.

pub mod backoff;
pub mod state;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use leadgen_common::{
    MessageResult, NewWorkItem, PipelineError, PipelineResult, QueueMessage, RetryPolicy,
    ScrapeQueueWorkItem, SourceType, WorkStatus,
};

use crate::clock::Clock;
use crate::store::{RetryScope, WorkItemStore};

pub use state::{can_transition, transition};

/// How many times a single operation re-reads a row after losing a CAS race.
const MAX_CAS_ATTEMPTS: usize = 8;

/// How many queued candidates a claim looks at per round.
const CLAIM_CANDIDATES: usize = 16;

/// Upper bound on rows examined by the sweeps (`requeue_due`, `reclaim_stuck`).
const SWEEP_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// First time this key was seen.
    Created(ScrapeQueueWorkItem),
    /// An idle item (pending, or failed with retries left and due) went back to `queued`.
    Requeued(ScrapeQueueWorkItem),
    /// The key is in flight, completed, waiting on backoff or terminally failed.
    AlreadyPresent(ScrapeQueueWorkItem),
}

impl EnqueueOutcome {
    pub fn item(&self) -> &ScrapeQueueWorkItem {
        match self {
            EnqueueOutcome::Created(item)
            | EnqueueOutcome::Requeued(item)
            | EnqueueOutcome::AlreadyPresent(item) => item,
        }
    }

    /// Whether this call put the item into `queued`.
    pub fn is_queued_now(&self) -> bool {
        !matches!(self, EnqueueOutcome::AlreadyPresent(_))
    }
}

/// A work item this worker owns until it reports back with `attempt`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedItem {
    pub item: ScrapeQueueWorkItem,
}

impl ClaimedItem {
    pub fn id(&self) -> Uuid {
        self.item.id
    }

    pub fn attempt(&self) -> i32 {
        self.item.attempt
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Succeeded { records_found: i32 },
    /// Network error or 5xx. Counts against the retry budget.
    TransientFailure { error: String },
    /// The bounded fetch timeout fired. Counts against the retry budget.
    TimedOut { error: String },
    /// The source rejected the target. Never retried automatically.
    PermanentFailure { error: String },
    /// Upstream asked us to back off. Parks the item without counting a failure.
    Deferred { retry_at: DateTime<Utc>, reason: String },
}

pub struct WorkQueue {
    store: Arc<dyn WorkItemStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn WorkItemStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { store, clock, retry }
    }

    // ---------------------------------------------------------------------------
    // Enqueue
    // ---------------------------------------------------------------------------

    /// Idempotent on the item key: never creates a duplicate, and only moves an
    /// existing item when it is idle.
    pub async fn enqueue(&self, new: NewWorkItem) -> PipelineResult<EnqueueOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let existing = self.store.find_item(&new.key).await?;

            let Some(existing) = existing else {
                let fresh = self.pending_item(&new, now);
                let (stored, created) = self.store.insert_item_if_absent(fresh).await?;
                if !created {
                    // Lost the insert race; re-read and treat it as existing.
                    continue;
                }
                let expected = stored.version;
                let mut queued = stored;
                transition(&mut queued, WorkStatus::Queued, now)?;
                if self.store.update_item(&queued, expected).await? {
                    queued.version = expected + 1;
                    info!(
                        work_item_id = %queued.id,
                        source_type = %queued.key.source_type,
                        zip_code = %queued.key.zip_code,
                        profession = %queued.key.profession,
                        priority = queued.priority,
                        "Work item enqueued"
                    );
                    return Ok(EnqueueOutcome::Created(queued));
                }
                continue;
            };

            let requeue = match existing.status {
                WorkStatus::Pending => true,
                WorkStatus::Failed => {
                    existing.has_retries_left()
                        && existing.next_retry_at.map_or(true, |at| at <= now)
                }
                WorkStatus::Queued | WorkStatus::Processing | WorkStatus::Completed => false,
            };
            if !requeue {
                debug!(
                    work_item_id = %existing.id,
                    status = %existing.status,
                    "Enqueue skipped, item already present"
                );
                return Ok(EnqueueOutcome::AlreadyPresent(existing));
            }

            let expected = existing.version;
            let mut item = existing;
            item.priority = new.priority;
            transition(&mut item, WorkStatus::Queued, now)?;
            if self.store.update_item(&item, expected).await? {
                item.version = expected + 1;
                info!(
                    work_item_id = %item.id,
                    consecutive_failures = item.consecutive_failures,
                    "Work item requeued"
                );
                return Ok(EnqueueOutcome::Requeued(item));
            }
        }
        Err(PipelineError::Conflict(format!(
            "enqueue of {}:{}:{} kept losing races",
            new.key.source_type, new.key.zip_code, new.key.profession
        )))
    }

    fn pending_item(&self, new: &NewWorkItem, now: DateTime<Utc>) -> ScrapeQueueWorkItem {
        ScrapeQueueWorkItem {
            id: Uuid::new_v4(),
            key: new.key.clone(),
            status: WorkStatus::Pending,
            priority: new.priority,
            attempt: 0,
            consecutive_failures: 0,
            max_retries: self.retry.max_retries,
            permanent_failure: false,
            last_error: None,
            records_found: 0,
            queued_at: None,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    // ---------------------------------------------------------------------------
    // Claim
    // ---------------------------------------------------------------------------

    pub async fn has_queued(&self, source_type: SourceType) -> PipelineResult<bool> {
        Ok(!self.store.queued_items(source_type, 1).await?.is_empty())
    }

    /// Take the highest-priority, oldest queued item for `source_type`.
    /// Candidates another worker claims first are skipped.
    pub async fn claim_next(&self, source_type: SourceType) -> PipelineResult<Option<ClaimedItem>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let candidates = self.store.queued_items(source_type, CLAIM_CANDIDATES).await?;
            if candidates.is_empty() {
                return Ok(None);
            }
            for candidate in candidates {
                let now = self.clock.now();
                let expected = candidate.version;
                let mut item = candidate;
                transition(&mut item, WorkStatus::Processing, now)?;
                if self.store.update_item(&item, expected).await? {
                    item.version = expected + 1;
                    info!(
                        work_item_id = %item.id,
                        attempt = item.attempt,
                        source_type = %source_type,
                        zip_code = %item.key.zip_code,
                        "Work item claimed"
                    );
                    return Ok(Some(ClaimedItem { item }));
                }
                debug!(work_item_id = %item.id, "Claim lost to another worker");
            }
        }
        Ok(None)
    }

    // ---------------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------------

    /// Apply a worker's report for `attempt` and log it as a queue message.
    pub async fn record_result(
        &self,
        item_id: Uuid,
        attempt: i32,
        outcome: WorkOutcome,
    ) -> PipelineResult<ScrapeQueueWorkItem> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let item = self
                .store
                .get_item(item_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("work item {item_id}")))?;
            // A reclaimed attempt has already been reported as timed out.
            if item.attempt != attempt || item.status != WorkStatus::Processing {
                warn!(
                    work_item_id = %item_id,
                    current = item.attempt,
                    reported = attempt,
                    status = %item.status,
                    "Rejecting stale completion report"
                );
                return Err(PipelineError::StaleCompletion {
                    current: item.attempt,
                    reported: attempt,
                });
            }

            let now = self.clock.now();
            let expected = item.version;
            let mut updated = item;
            let result = self.apply_outcome(&mut updated, &outcome, now)?;

            // Only the CAS winner appends, so the chain read here is still current
            // if the write below lands.
            let previous = self.store.messages_for(item_id).await?;
            let dispatched_at = updated.started_at.unwrap_or(now);
            let message = QueueMessage {
                id: Uuid::new_v4(),
                work_item_id: item_id,
                attempt,
                source_type: updated.key.source_type,
                dispatched_at,
                finished_at: now,
                duration_ms: (now - dispatched_at).num_milliseconds().max(0),
                result,
                records_found: updated.records_found,
                error: updated.last_error.clone().filter(|_| result != MessageResult::Succeeded),
                retry_of: previous.last().map(|m| m.id),
            };
            if !self.store.complete_attempt(&updated, expected, message).await? {
                continue;
            }
            updated.version = expected + 1;
            return Ok(updated);
        }
        Err(PipelineError::Conflict(format!(
            "recording result for work item {item_id} kept losing races"
        )))
    }

    fn apply_outcome(
        &self,
        item: &mut ScrapeQueueWorkItem,
        outcome: &WorkOutcome,
        now: DateTime<Utc>,
    ) -> PipelineResult<MessageResult> {
        match outcome {
            WorkOutcome::Succeeded { records_found } => {
                transition(item, WorkStatus::Completed, now)?;
                item.records_found = *records_found;
                item.consecutive_failures = 0;
                item.last_error = None;
                item.next_retry_at = None;
                info!(
                    work_item_id = %item.id,
                    attempt = item.attempt,
                    records_found,
                    "Work item completed"
                );
                Ok(MessageResult::Succeeded)
            }
            WorkOutcome::TransientFailure { error } | WorkOutcome::TimedOut { error } => {
                transition(item, WorkStatus::Failed, now)?;
                item.consecutive_failures += 1;
                item.last_error = Some(error.clone());
                self.schedule_retry(item, now);
                Ok(match outcome {
                    WorkOutcome::TimedOut { .. } => MessageResult::TimedOut,
                    _ => MessageResult::Failed,
                })
            }
            WorkOutcome::PermanentFailure { error } => {
                transition(item, WorkStatus::Failed, now)?;
                item.consecutive_failures += 1;
                item.permanent_failure = true;
                item.last_error = Some(error.clone());
                item.next_retry_at = None;
                warn!(
                    work_item_id = %item.id,
                    error = %error,
                    "Work item failed permanently, flagged for review"
                );
                Ok(MessageResult::PermanentFailure)
            }
            WorkOutcome::Deferred { retry_at, reason } => {
                transition(item, WorkStatus::Failed, now)?;
                item.last_error = Some(reason.clone());
                item.next_retry_at = Some(*retry_at);
                info!(
                    work_item_id = %item.id,
                    retry_at = %retry_at,
                    "Work item deferred by upstream rate limit"
                );
                Ok(MessageResult::Deferred)
            }
        }
    }

    fn schedule_retry(&self, item: &mut ScrapeQueueWorkItem, now: DateTime<Utc>) {
        if item.has_retries_left() {
            let delay = backoff::retry_delay(&self.retry, item.consecutive_failures);
            item.next_retry_at = Some(now + delay);
            warn!(
                work_item_id = %item.id,
                consecutive_failures = item.consecutive_failures,
                retry_in_secs = delay.num_seconds(),
                error = item.last_error.as_deref().unwrap_or(""),
                "Work item failed, retry scheduled"
            );
        } else {
            item.next_retry_at = None;
            warn!(
                work_item_id = %item.id,
                consecutive_failures = item.consecutive_failures,
                "Work item exhausted retries, flagged for review"
            );
        }
    }

    // ---------------------------------------------------------------------------
    // Sweeps
    // ---------------------------------------------------------------------------

    /// Move failed items whose backoff has elapsed back to `queued`.
    pub async fn requeue_due(&self) -> PipelineResult<usize> {
        let now = self.clock.now();
        let due = self
            .store
            .due_retries(&RetryScope::default(), now, SWEEP_LIMIT)
            .await?;
        let mut requeued = 0;
        for item in due {
            let expected = item.version;
            let mut item = item;
            transition(&mut item, WorkStatus::Queued, now)?;
            if self.store.update_item(&item, expected).await? {
                debug!(work_item_id = %item.id, "Backoff elapsed, item requeued");
                requeued += 1;
            }
        }
        if requeued > 0 {
            info!(requeued, "Requeued failed work items");
        }
        Ok(requeued)
    }

    /// Fail items stuck in `processing` for longer than `lease`, as if their
    /// fetch had timed out. A late report from the original worker is then stale.
    pub async fn reclaim_stuck(&self, lease: Duration) -> PipelineResult<usize> {
        let now = self.clock.now();
        let stuck = self.store.stuck_items(now - lease, SWEEP_LIMIT).await?;
        let mut reclaimed = 0;
        for item in stuck {
            let outcome = WorkOutcome::TimedOut {
                error: format!("no report within {}s lease", lease.num_seconds()),
            };
            match self.record_result(item.id, item.attempt, outcome).await {
                Ok(_) => reclaimed += 1,
                Err(PipelineError::StaleCompletion { .. }) | Err(PipelineError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed stuck work items");
        }
        Ok(reclaimed)
    }

    /// Terminally failed items awaiting manual triage.
    pub async fn needs_review(&self) -> PipelineResult<Vec<ScrapeQueueWorkItem>> {
        Ok(self.store.terminal_failures(SWEEP_LIMIT).await?)
    }

    pub async fn get(&self, item_id: Uuid) -> PipelineResult<ScrapeQueueWorkItem> {
        self.store
            .get_item(item_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("work item {item_id}")))
    }

    pub async fn messages(&self, item_id: Uuid) -> PipelineResult<Vec<QueueMessage>> {
        Ok(self.store.messages_for(item_id).await?)
    }
}
