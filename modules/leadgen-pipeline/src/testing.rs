// Test doubles for the lead pipeline.
//
// Three doubles for the non-store boundaries:
// - ManualClock (Clock): time moves only when the test says so
// - MockFetcher (SourceFetcher): HashMap-based target→records, scripted failures
// - MockEnrichment (EnrichmentProvider): fixed partial enrichment or a failure, optional delay
//
// Stores are the real MemoryStore. Plus fixtures for records, work items,
// targets and schedules, and `memory_deps` to wire a whole pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use uuid::Uuid;

use leadgen_common::{
    EnrichedLead, LeadGrade, LeadStatus, NewRawRecord, NewWorkItem, PartialEnrichment,
    PipelinePolicy, RawBusinessRecord, ScrapeSchedule, ScrapeTarget, SelectionStrategy,
    SocialLinks, SourceType, TargetSelector, WorkItemKey,
};

use crate::clock::Clock;
use crate::store::{MemoryStore, StaticTargets};
use crate::traits::{EnrichmentProvider, FetchError, FetchTarget, SourceFetcher};
use crate::worker::PipelineDeps;

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Wednesday 2026-03-04 12:00 UTC.
    pub fn at_noon() -> Self {
        Self::new(noon())
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

type FetchKey = (SourceType, String, String);

/// Returns the records registered for `(source, zip, profession)`, or a
/// permanent error for unregistered targets. Scripted failures are consumed
/// first, one per call. Builder pattern: `.on_fetch()`, `.fail_next()`, `.with_delay()`.
pub struct MockFetcher {
    responses: HashMap<FetchKey, Vec<NewRawRecord>>,
    failures: Mutex<HashMap<FetchKey, VecDeque<FetchError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn on_fetch(
        mut self,
        source_type: SourceType,
        zip_code: &str,
        profession: &str,
        records: Vec<NewRawRecord>,
    ) -> Self {
        self.responses.insert(
            (source_type, zip_code.to_string(), profession.to_string()),
            records,
        );
        self
    }

    pub fn fail_next(
        self,
        source_type: SourceType,
        zip_code: &str,
        profession: &str,
        error: FetchError,
    ) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry((source_type, zip_code.to_string(), profession.to_string()))
            .or_default()
            .push_back(error);
        self
    }

    /// Every fetch sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    async fn fetch(
        &self,
        source_type: SourceType,
        target: &FetchTarget,
    ) -> Result<Vec<NewRawRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = (
            source_type,
            target.zip_code.clone(),
            target.profession.clone(),
        );
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        let result = match scripted {
            Some(error) => Err(error),
            None => self.responses.get(&key).cloned().ok_or_else(|| {
                FetchError::Permanent(format!(
                    "MockFetcher: no response registered for {source_type}:{}:{}",
                    target.zip_code, target.profession
                ))
            }),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// MockEnrichment
// ---------------------------------------------------------------------------

pub struct MockEnrichment {
    name: String,
    response: Option<PartialEnrichment>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockEnrichment {
    pub fn returning(name: &str, partial: PartialEnrichment) -> Self {
        Self {
            name: name.to_string(),
            response: Some(partial),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A provider whose every call errors.
    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every lookup sleeps this long first, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentProvider for MockEnrichment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enrich_external(&self, raw: &RawBusinessRecord) -> anyhow::Result<PartialEnrichment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.response {
            Some(partial) => Ok(partial.clone()),
            None => anyhow::bail!("MockEnrichment {}: lookup failed for {}", self.name, raw.id),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// No website, no category, no phone, an interior-number address.
pub fn joes_plumbing() -> NewRawRecord {
    NewRawRecord::builder()
        .source(SourceType::GoogleMaps)
        .source_id("abc123")
        .business_name("Joe's Plumbing")
        .address_line("Calle 7 Int 4B")
        .city("Austin")
        .state("TX")
        .zip_code("78701")
        .build()
}

/// A business with a website and a clean street address.
pub fn findable_business(source_id: &str, name: &str) -> NewRawRecord {
    NewRawRecord::builder()
        .source(SourceType::GoogleMaps)
        .source_id(source_id)
        .business_name(name)
        .category("plumber")
        .phone("(512) 555-0199")
        .website(Some("https://example-plumbing.com".to_string()))
        .address_line("1200 Congress Ave")
        .city("Austin")
        .state("TX")
        .zip_code("78701")
        .geocode_confidence(0.98)
        .review_count(120)
        .rating(4.7)
        .build()
}

/// Registry answer that takes Joe's Plumbing to grade B.
pub fn registry_partial() -> PartialEnrichment {
    PartialEnrichment {
        provider: "registry".into(),
        phone: Some("(512) 555-0100".into()),
        review_count: Some(20),
        rating: Some(4.5),
        years_in_business: Some(8),
        ..Default::default()
    }
}

/// A grade-A lead ready to publish, detached from any raw record.
pub fn ready_lead(business_name: &str, city: &str) -> EnrichedLead {
    EnrichedLead {
        id: Uuid::new_v4(),
        raw_record_id: Uuid::new_v4(),
        business_name: business_name.to_string(),
        category: Some("handyman".into()),
        phone: Some("7135550100".into()),
        email: None,
        website: None,
        owner_name: None,
        social: SocialLinks::default(),
        address_line: None,
        city: Some(city.to_string()),
        state: Some("TX".into()),
        zip_code: Some("77002".into()),
        review_count: Some(40),
        rating: Some(4.8),
        years_in_business: Some(12),
        icp_score: 80,
        enrichment_confidence: 0.9,
        enrichment_sources: vec!["registry".into()],
        lead_score: 90,
        lead_grade: LeadGrade::A,
        status: LeadStatus::Ready,
        rejection_reason: None,
        created_at: noon(),
        updated_at: noon(),
        version: 0,
    }
}

pub fn work_key(source_type: SourceType, zip_code: &str, profession: &str) -> WorkItemKey {
    WorkItemKey {
        zip_code: zip_code.to_string(),
        state: "TX".to_string(),
        source_type,
        profession: profession.to_string(),
    }
}

pub fn work_item(zip_code: &str, priority: i32) -> NewWorkItem {
    NewWorkItem {
        key: work_key(SourceType::GoogleMaps, zip_code, "plumber"),
        priority,
    }
}

pub fn target(zip_code: &str, state: &str, priority: i32) -> ScrapeTarget {
    ScrapeTarget {
        zip_code: zip_code.to_string(),
        state: state.to_string(),
        priority,
    }
}

/// Enabled, all-day, due at `next_run_at`, every 24 hours.
pub fn schedule(name: &str, strategy: SelectionStrategy, next_run_at: DateTime<Utc>) -> ScrapeSchedule {
    ScrapeSchedule {
        id: Uuid::new_v4(),
        name: name.to_string(),
        enabled: true,
        source_type: SourceType::GoogleMaps,
        profession: "plumber".to_string(),
        target: TargetSelector::default(),
        strategy,
        zip_limit_per_run: 0,
        frequency_hours: 24,
        recurrence: None,
        start_time: NaiveTime::MIN,
        end_time: NaiveTime::MIN,
        allowed_weekdays: vec![],
        max_concurrent: 2,
        delay_between_requests_ms: 0,
        priority: 0,
        next_run_at,
        last_run_at: None,
        last_run_enqueued: 0,
        last_error: None,
        version: 0,
    }
}

/// Every store backed by one `MemoryStore`, default policy.
pub fn memory_deps(
    store: Arc<MemoryStore>,
    targets: Vec<ScrapeTarget>,
    fetcher: Arc<dyn SourceFetcher>,
    providers: Vec<Arc<dyn EnrichmentProvider>>,
    clock: Arc<dyn Clock>,
) -> PipelineDeps {
    PipelineDeps::builder()
        .raw_records(store.clone())
        .leads(store.clone())
        .profiles(store.clone())
        .work_items(store.clone())
        .buckets(store.clone())
        .schedules(store)
        .targets(Arc::new(StaticTargets::new(targets)))
        .fetcher(fetcher)
        .providers(providers)
        .clock(clock)
        .policy(PipelinePolicy::default())
        .build()
}
