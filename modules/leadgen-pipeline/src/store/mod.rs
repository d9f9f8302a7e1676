// Persistence boundaries, one per pipeline stage.
//
// Every mutable row carries a `version`. Writers read a row, change it in
// memory, and hand it back with the version they read; the store applies the
// write only if the row still has that version and bumps it by one. Workers
// may run as separate processes, so no component relies on in-process locks
// for correctness.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use leadgen_common::{
    EnrichedLead, GhostProfile, IcpSignal, NewRawRecord, QueueMessage, RateLimitBucket,
    RawBusinessRecord, RawStatus, ScrapeQueueWorkItem, ScrapeSchedule, ScrapeTarget, SourceType,
    TargetSelector, WorkItemKey, WorkStatus,
};

pub use memory::{MemoryStore, StaticTargets};
pub use postgres::PgStore;

// ---------------------------------------------------------------------------
// Stage 1: raw records and their ICP signals
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RawRecordStore: Send + Sync {
    /// Insert on first sighting of `(source, source_id)`, otherwise overwrite the
    /// existing row in place. Returns the stored row and whether it was created.
    async fn upsert_raw(
        &self,
        record: NewRawRecord,
        now: DateTime<Utc>,
    ) -> Result<(RawBusinessRecord, bool)>;

    async fn get_raw(&self, id: Uuid) -> Result<Option<RawBusinessRecord>>;

    async fn find_raw(&self, source: SourceType, source_id: &str) -> Result<Option<RawBusinessRecord>>;

    async fn set_raw_status(&self, id: Uuid, status: RawStatus) -> Result<()>;

    /// Append a signal unless an identical assessment (same record, detector
    /// version and input fingerprint) exists; returns whichever row is stored.
    async fn insert_signal(&self, signal: IcpSignal) -> Result<IcpSignal>;

    async fn latest_signal(&self, raw_record_id: Uuid) -> Result<Option<IcpSignal>>;
}

// ---------------------------------------------------------------------------
// Stage 2: enriched leads
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Insert unless a lead already exists for the raw record. Returns the stored
    /// lead and whether this call created it.
    async fn insert_lead_if_absent(&self, lead: EnrichedLead) -> Result<(EnrichedLead, bool)>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<EnrichedLead>>;

    async fn lead_for_raw(&self, raw_record_id: Uuid) -> Result<Option<EnrichedLead>>;

    /// Compare-and-set on `version`. Returns false if the row moved on.
    async fn update_lead(&self, lead: &EnrichedLead, expected_version: i64) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Stage 3: ghost profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ProfileInsert {
    Inserted(GhostProfile),
    /// Another profile owns the slug.
    SlugTaken,
    /// The lead was published concurrently; here is the winner.
    AlreadyPublished(GhostProfile),
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, id: Uuid) -> Result<Option<GhostProfile>>;

    async fn profile_for_lead(&self, lead_id: Uuid) -> Result<Option<GhostProfile>>;

    async fn profile_by_slug(&self, slug: &str) -> Result<Option<GhostProfile>>;

    /// Highest `n` among slugs of the form `{stem}-{n}`.
    async fn max_slug_suffix(&self, stem: &str) -> Result<Option<u64>>;

    /// Persist the whole profile or nothing.
    async fn insert_profile(&self, profile: GhostProfile) -> Result<ProfileInsert>;

    /// `claimed_at IS NULL -> now`. Returns None when the profile was already claimed
    /// or does not exist.
    async fn claim_profile(
        &self,
        id: Uuid,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GhostProfile>>;
}

// ---------------------------------------------------------------------------
// Work queue and its audit log
// ---------------------------------------------------------------------------

/// One aggregate row of the queue, grouped by source and status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummaryRow {
    pub source_type: SourceType,
    pub status: WorkStatus,
    pub count: i64,
    /// Failed items that will be retried automatically.
    pub retryable: i64,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// Narrows [`WorkItemStore::due_retries`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RetryScope {
    pub source_type: Option<SourceType>,
    pub profession: Option<String>,
    pub target: TargetSelector,
}

impl RetryScope {
    pub fn matches(&self, key: &WorkItemKey) -> bool {
        self.source_type.map_or(true, |t| t == key.source_type)
            && self.profession.as_deref().map_or(true, |p| p == key.profession)
            && self.target.matches(&key.state, &key.zip_code)
    }
}

#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Insert unless the key exists. Returns the stored item and whether it was created.
    async fn insert_item_if_absent(
        &self,
        item: ScrapeQueueWorkItem,
    ) -> Result<(ScrapeQueueWorkItem, bool)>;

    async fn get_item(&self, id: Uuid) -> Result<Option<ScrapeQueueWorkItem>>;

    async fn find_item(&self, key: &WorkItemKey) -> Result<Option<ScrapeQueueWorkItem>>;

    /// Compare-and-set on `version`. Returns false if the row moved on.
    async fn update_item(&self, item: &ScrapeQueueWorkItem, expected_version: i64) -> Result<bool>;

    /// Queued items for one source in dispatch order: priority descending,
    /// then oldest `queued_at` first.
    async fn queued_items(
        &self,
        source_type: SourceType,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>>;

    /// Failed items that may still run and whose backoff has ended by `now`,
    /// highest priority first. Terminal failures never appear here, however
    /// many of them pile up.
    async fn due_retries(
        &self,
        scope: &RetryScope,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>>;

    /// Failed items that will not be retried: permanent, or out of retries.
    /// Oldest first.
    async fn terminal_failures(&self, limit: usize) -> Result<Vec<ScrapeQueueWorkItem>>;

    /// `processing` items claimed before `started_before`, oldest first.
    async fn stuck_items(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>>;

    async fn queue_summary(&self) -> Result<Vec<QueueSummaryRow>>;

    /// Compare-and-set the item and append its attempt's message as one write:
    /// both land or neither. Returns false, appending nothing, if the row moved on.
    async fn complete_attempt(
        &self,
        item: &ScrapeQueueWorkItem,
        expected_version: i64,
        message: QueueMessage,
    ) -> Result<bool>;

    /// Messages for one item, oldest first.
    async fn messages_for(&self, work_item_id: Uuid) -> Result<Vec<QueueMessage>>;
}

// ---------------------------------------------------------------------------
// Rate limit buckets
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get_bucket(
        &self,
        source_type: SourceType,
        source_key: &str,
    ) -> Result<Option<RateLimitBucket>>;

    /// Insert unless the bucket exists; returns the stored bucket either way.
    async fn insert_bucket_if_absent(&self, bucket: RateLimitBucket) -> Result<RateLimitBucket>;

    /// Compare-and-set on `version`. Returns false if another dispatcher got there first.
    async fn update_bucket(&self, bucket: &RateLimitBucket, expected_version: i64) -> Result<bool>;

    async fn all_buckets(&self) -> Result<Vec<RateLimitBucket>>;
}

// ---------------------------------------------------------------------------
// Schedules and targets
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_schedule(&self, schedule: ScrapeSchedule) -> Result<()>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScrapeSchedule>>;

    async fn all_schedules(&self) -> Result<Vec<ScrapeSchedule>>;

    /// Compare-and-set on `version`.
    async fn update_schedule(&self, schedule: &ScrapeSchedule, expected_version: i64) -> Result<bool>;
}

/// Read-only catalog of geographies a schedule can target.
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    async fn targets(&self, selector: &TargetSelector) -> Result<Vec<ScrapeTarget>>;
}
