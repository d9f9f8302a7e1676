//! In-process implementation of every store trait.
//!
//! Unique keys and compare-and-set behave exactly as the Postgres schema
//! enforces them, so the same service code and tests run against either.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use leadgen_common::{
    EnrichedLead, GhostProfile, IcpSignal, NewRawRecord, QueueMessage, RateLimitBucket,
    RawBusinessRecord, RawStatus, ScrapeQueueWorkItem, ScrapeSchedule, ScrapeTarget, SourceType,
    TargetSelector, WorkItemKey, WorkStatus,
};

use super::{
    LeadStore, ProfileInsert, ProfileStore, QueueSummaryRow, RateLimitStore, RawRecordStore,
    RetryScope, ScheduleStore, TargetCatalog, WorkItemStore,
};
use crate::publisher::slug;

#[derive(Default)]
struct Inner {
    raws: HashMap<Uuid, RawBusinessRecord>,
    raw_keys: HashMap<(SourceType, String), Uuid>,
    signals: Vec<IcpSignal>,
    leads: HashMap<Uuid, EnrichedLead>,
    lead_by_raw: HashMap<Uuid, Uuid>,
    profiles: HashMap<Uuid, GhostProfile>,
    profile_by_lead: HashMap<Uuid, Uuid>,
    profile_by_slug: HashMap<String, Uuid>,
    items: HashMap<Uuid, ScrapeQueueWorkItem>,
    item_keys: HashMap<WorkItemKey, Uuid>,
    messages: Vec<QueueMessage>,
    buckets: HashMap<(SourceType, String), RateLimitBucket>,
    schedules: HashMap<Uuid, ScrapeSchedule>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    /// Number of raw records held; handy for idempotence checks.
    pub fn raw_count(&self) -> Result<usize> {
        Ok(self.lock()?.raws.len())
    }

    pub fn lead_count(&self) -> Result<usize> {
        Ok(self.lock()?.leads.len())
    }

    pub fn profile_count(&self) -> Result<usize> {
        Ok(self.lock()?.profiles.len())
    }

    pub fn signal_count(&self) -> Result<usize> {
        Ok(self.lock()?.signals.len())
    }
}

// ---------------------------------------------------------------------------
// RawRecordStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RawRecordStore for MemoryStore {
    async fn upsert_raw(
        &self,
        record: NewRawRecord,
        now: DateTime<Utc>,
    ) -> Result<(RawBusinessRecord, bool)> {
        let mut inner = self.lock()?;
        let key = (record.source, record.source_id.clone());
        if let Some(id) = inner.raw_keys.get(&key).copied() {
            let existing = inner
                .raws
                .get_mut(&id)
                .ok_or_else(|| anyhow!("raw key index points at missing record {id}"))?;
            existing.refresh_from(record, now);
            existing.version += 1;
            return Ok((existing.clone(), false));
        }

        let created = RawBusinessRecord::from_new(record, now);
        inner.raw_keys.insert(key, created.id);
        inner.raws.insert(created.id, created.clone());
        Ok((created, true))
    }

    async fn get_raw(&self, id: Uuid) -> Result<Option<RawBusinessRecord>> {
        Ok(self.lock()?.raws.get(&id).cloned())
    }

    async fn find_raw(&self, source: SourceType, source_id: &str) -> Result<Option<RawBusinessRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .raw_keys
            .get(&(source, source_id.to_string()))
            .and_then(|id| inner.raws.get(id))
            .cloned())
    }

    async fn set_raw_status(&self, id: Uuid, status: RawStatus) -> Result<()> {
        let mut inner = self.lock()?;
        let raw = inner
            .raws
            .get_mut(&id)
            .ok_or_else(|| anyhow!("raw record {id} not found"))?;
        raw.status = status;
        raw.version += 1;
        Ok(())
    }

    async fn insert_signal(&self, signal: IcpSignal) -> Result<IcpSignal> {
        let mut inner = self.lock()?;
        if !inner.raws.contains_key(&signal.assessment.raw_record_id) {
            return Err(anyhow!(
                "raw record {} not found",
                signal.assessment.raw_record_id
            ));
        }
        let existing = inner.signals.iter().find(|s| {
            s.assessment.raw_record_id == signal.assessment.raw_record_id
                && s.assessment.detector_version == signal.assessment.detector_version
                && s.assessment.input_fingerprint == signal.assessment.input_fingerprint
        });
        if let Some(existing) = existing {
            return Ok(existing.clone());
        }
        inner.signals.push(signal.clone());
        Ok(signal)
    }

    async fn latest_signal(&self, raw_record_id: Uuid) -> Result<Option<IcpSignal>> {
        let inner = self.lock()?;
        Ok(inner
            .signals
            .iter()
            .rev()
            .find(|s| s.assessment.raw_record_id == raw_record_id)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// LeadStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LeadStore for MemoryStore {
    async fn insert_lead_if_absent(&self, lead: EnrichedLead) -> Result<(EnrichedLead, bool)> {
        let mut inner = self.lock()?;
        if let Some(existing_id) = inner.lead_by_raw.get(&lead.raw_record_id).copied() {
            let existing = inner
                .leads
                .get(&existing_id)
                .cloned()
                .ok_or_else(|| anyhow!("lead index points at missing lead {existing_id}"))?;
            return Ok((existing, false));
        }
        inner.lead_by_raw.insert(lead.raw_record_id, lead.id);
        inner.leads.insert(lead.id, lead.clone());
        Ok((lead, true))
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<EnrichedLead>> {
        Ok(self.lock()?.leads.get(&id).cloned())
    }

    async fn lead_for_raw(&self, raw_record_id: Uuid) -> Result<Option<EnrichedLead>> {
        let inner = self.lock()?;
        Ok(inner
            .lead_by_raw
            .get(&raw_record_id)
            .and_then(|id| inner.leads.get(id))
            .cloned())
    }

    async fn update_lead(&self, lead: &EnrichedLead, expected_version: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.leads.get_mut(&lead.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = lead.clone();
                stored.version = expected_version + 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(anyhow!("lead {} not found", lead.id)),
        }
    }
}

// ---------------------------------------------------------------------------
// ProfileStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get_profile(&self, id: Uuid) -> Result<Option<GhostProfile>> {
        Ok(self.lock()?.profiles.get(&id).cloned())
    }

    async fn profile_for_lead(&self, lead_id: Uuid) -> Result<Option<GhostProfile>> {
        let inner = self.lock()?;
        Ok(inner
            .profile_by_lead
            .get(&lead_id)
            .and_then(|id| inner.profiles.get(id))
            .cloned())
    }

    async fn profile_by_slug(&self, slug: &str) -> Result<Option<GhostProfile>> {
        let inner = self.lock()?;
        Ok(inner
            .profile_by_slug
            .get(slug)
            .and_then(|id| inner.profiles.get(id))
            .cloned())
    }

    async fn max_slug_suffix(&self, stem: &str) -> Result<Option<u64>> {
        Ok(self
            .lock()?
            .profile_by_slug
            .keys()
            .filter_map(|s| slug::counter_of(s, stem))
            .max())
    }

    async fn insert_profile(&self, profile: GhostProfile) -> Result<ProfileInsert> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .profile_by_lead
            .get(&profile.enriched_lead_id)
            .and_then(|id| inner.profiles.get(id))
        {
            return Ok(ProfileInsert::AlreadyPublished(existing.clone()));
        }
        if inner.profile_by_slug.contains_key(&profile.slug) {
            return Ok(ProfileInsert::SlugTaken);
        }
        inner
            .profile_by_lead
            .insert(profile.enriched_lead_id, profile.id);
        inner.profile_by_slug.insert(profile.slug.clone(), profile.id);
        inner.profiles.insert(profile.id, profile.clone());
        Ok(ProfileInsert::Inserted(profile))
    }

    async fn claim_profile(
        &self,
        id: Uuid,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GhostProfile>> {
        let mut inner = self.lock()?;
        match inner.profiles.get_mut(&id) {
            Some(profile) if profile.claimed_at.is_none() => {
                profile.is_claimed = true;
                profile.claimed_at = Some(now);
                profile.claimed_by = Some(claimant.to_string());
                profile.version += 1;
                Ok(Some(profile.clone()))
            }
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkItemStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkItemStore for MemoryStore {
    async fn insert_item_if_absent(
        &self,
        item: ScrapeQueueWorkItem,
    ) -> Result<(ScrapeQueueWorkItem, bool)> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .item_keys
            .get(&item.key)
            .and_then(|id| inner.items.get(id))
        {
            return Ok((existing.clone(), false));
        }
        inner.item_keys.insert(item.key.clone(), item.id);
        inner.items.insert(item.id, item.clone());
        Ok((item, true))
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<ScrapeQueueWorkItem>> {
        Ok(self.lock()?.items.get(&id).cloned())
    }

    async fn find_item(&self, key: &WorkItemKey) -> Result<Option<ScrapeQueueWorkItem>> {
        let inner = self.lock()?;
        Ok(inner
            .item_keys
            .get(key)
            .and_then(|id| inner.items.get(id))
            .cloned())
    }

    async fn update_item(&self, item: &ScrapeQueueWorkItem, expected_version: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.items.get_mut(&item.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = item.clone();
                stored.version = expected_version + 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(anyhow!("work item {} not found", item.id)),
        }
    }

    async fn queued_items(
        &self,
        source_type: SourceType,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>> {
        let inner = self.lock()?;
        let mut queued: Vec<_> = inner
            .items
            .values()
            .filter(|i| i.status == WorkStatus::Queued && i.key.source_type == source_type)
            .cloned()
            .collect();
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queued_at.cmp(&b.queued_at))
                .then(a.created_at.cmp(&b.created_at))
        });
        queued.truncate(limit);
        Ok(queued)
    }

    async fn due_retries(
        &self,
        scope: &RetryScope,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>> {
        let inner = self.lock()?;
        let mut items: Vec<_> = inner
            .items
            .values()
            .filter(|i| {
                i.status == WorkStatus::Failed
                    && i.has_retries_left()
                    && i.next_retry_at.map_or(true, |at| at <= now)
                    && scope.matches(&i.key)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_retry_at.cmp(&b.next_retry_at))
                .then(a.id.cmp(&b.id))
        });
        items.truncate(limit);
        Ok(items)
    }

    async fn terminal_failures(&self, limit: usize) -> Result<Vec<ScrapeQueueWorkItem>> {
        let inner = self.lock()?;
        let mut items: Vec<_> = inner
            .items
            .values()
            .filter(|i| i.status == WorkStatus::Failed && !i.has_retries_left())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn stuck_items(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>> {
        let inner = self.lock()?;
        let mut items: Vec<_> = inner
            .items
            .values()
            .filter(|i| {
                i.status == WorkStatus::Processing
                    && i.started_at.map_or(true, |at| at <= started_before)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn queue_summary(&self) -> Result<Vec<QueueSummaryRow>> {
        let inner = self.lock()?;
        let mut rows: HashMap<(SourceType, WorkStatus), QueueSummaryRow> = HashMap::new();
        for item in inner.items.values() {
            let row = rows
                .entry((item.key.source_type, item.status))
                .or_insert_with(|| QueueSummaryRow {
                    source_type: item.key.source_type,
                    status: item.status,
                    count: 0,
                    retryable: 0,
                    oldest_queued_at: None,
                });
            row.count += 1;
            if item.status == WorkStatus::Failed && item.has_retries_left() {
                row.retryable += 1;
            }
            if item.status == WorkStatus::Queued {
                row.oldest_queued_at = match (row.oldest_queued_at, item.queued_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        let mut rows: Vec<_> = rows.into_values().collect();
        rows.sort_by(|a, b| {
            a.source_type
                .cmp(&b.source_type)
                .then(a.status.as_str().cmp(b.status.as_str()))
        });
        Ok(rows)
    }

    async fn complete_attempt(
        &self,
        item: &ScrapeQueueWorkItem,
        expected_version: i64,
        message: QueueMessage,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.items.get_mut(&item.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = item.clone();
                stored.version = expected_version + 1;
            }
            Some(_) => return Ok(false),
            None => return Err(anyhow!("work item {} not found", item.id)),
        }
        inner.messages.push(message);
        Ok(true)
    }

    async fn messages_for(&self, work_item_id: Uuid) -> Result<Vec<QueueMessage>> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.work_item_id == work_item_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// RateLimitStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get_bucket(
        &self,
        source_type: SourceType,
        source_key: &str,
    ) -> Result<Option<RateLimitBucket>> {
        Ok(self
            .lock()?
            .buckets
            .get(&(source_type, source_key.to_string()))
            .cloned())
    }

    async fn insert_bucket_if_absent(&self, bucket: RateLimitBucket) -> Result<RateLimitBucket> {
        let mut inner = self.lock()?;
        let stored = inner
            .buckets
            .entry((bucket.source_type, bucket.source_key.clone()))
            .or_insert(bucket);
        Ok(stored.clone())
    }

    async fn update_bucket(&self, bucket: &RateLimitBucket, expected_version: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner
            .buckets
            .get_mut(&(bucket.source_type, bucket.source_key.clone()))
        {
            Some(stored) if stored.version == expected_version => {
                *stored = bucket.clone();
                stored.version = expected_version + 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(anyhow!(
                "rate limit bucket {}:{} not found",
                bucket.source_type,
                bucket.source_key
            )),
        }
    }

    async fn all_buckets(&self) -> Result<Vec<RateLimitBucket>> {
        let inner = self.lock()?;
        let mut buckets: Vec<_> = inner.buckets.values().cloned().collect();
        buckets.sort_by(|a, b| {
            a.source_type
                .cmp(&b.source_type)
                .then(a.source_key.cmp(&b.source_key))
        });
        Ok(buckets)
    }
}

// ---------------------------------------------------------------------------
// ScheduleStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn insert_schedule(&self, schedule: ScrapeSchedule) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.schedules.contains_key(&schedule.id) {
            return Err(anyhow!("schedule {} already exists", schedule.id));
        }
        inner.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScrapeSchedule>> {
        Ok(self.lock()?.schedules.get(&id).cloned())
    }

    async fn all_schedules(&self) -> Result<Vec<ScrapeSchedule>> {
        let inner = self.lock()?;
        let mut schedules: Vec<_> = inner.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(schedules)
    }

    async fn update_schedule(&self, schedule: &ScrapeSchedule, expected_version: i64) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.schedules.get_mut(&schedule.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = schedule.clone();
                stored.version = expected_version + 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(anyhow!("schedule {} not found", schedule.id)),
        }
    }
}

// ---------------------------------------------------------------------------
// StaticTargets
// ---------------------------------------------------------------------------

/// Fixed list of targets, filtered by selector.
pub struct StaticTargets {
    targets: Vec<ScrapeTarget>,
}

impl StaticTargets {
    pub fn new(targets: Vec<ScrapeTarget>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl TargetCatalog for StaticTargets {
    async fn targets(&self, selector: &TargetSelector) -> Result<Vec<ScrapeTarget>> {
        Ok(self
            .targets
            .iter()
            .filter(|t| selector.matches(&t.state, &t.zip_code))
            .cloned()
            .collect())
    }
}
