use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::PipelineError;

/// Implements `as_str`, `Display` and `FromStr` for a unit-only enum whose
/// text form is the column value stored in Postgres.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = PipelineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(PipelineError::DataValidation(format!(
                        "unknown {} value: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// --- Sources ---

/// External source a business record or scrape target comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    GoogleMaps,
    Yelp,
    StateLicensing,
    Bbb,
    Facebook,
}

text_enum!(SourceType {
    GoogleMaps => "google_maps",
    Yelp => "yelp",
    StateLicensing => "state_licensing",
    Bbb => "bbb",
    Facebook => "facebook",
});

// --- Raw records (stage 1) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStatus {
    New,
    Processed,
    Enriched,
    Rejected,
}

text_enum!(RawStatus {
    New => "new",
    Processed => "processed",
    Enriched => "enriched",
    Rejected => "rejected",
});

/// A business as reported by one external source, before validation.
/// `raw_data` is the only untyped field: the source payload is not ours to shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct NewRawRecord {
    pub source: SourceType,
    #[builder(setter(into))]
    pub source_id: String,
    #[builder(setter(into))]
    pub business_name: String,
    #[builder(default, setter(into, strip_option))]
    pub category: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub phone: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub email: Option<String>,
    #[builder(default, setter(into))]
    pub website: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub address_line: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub city: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub state: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub zip_code: Option<String>,
    #[builder(default, setter(strip_option))]
    pub latitude: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub longitude: Option<f64>,
    /// 0.0..=1.0 confidence reported by the source's geocoder.
    #[builder(default, setter(strip_option))]
    pub geocode_confidence: Option<f64>,
    #[builder(default)]
    pub social_links: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub review_count: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub rating: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub years_in_business: Option<i32>,
    #[builder(default = serde_json::Value::Null)]
    pub raw_data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBusinessRecord {
    pub id: Uuid,
    pub source: SourceType,
    pub source_id: String,
    pub business_name: String,
    pub category: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub address_line: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geocode_confidence: Option<f64>,
    pub social_links: Vec<String>,
    pub review_count: Option<i32>,
    pub rating: Option<f64>,
    pub years_in_business: Option<i32>,
    pub raw_data: serde_json::Value,
    pub status: RawStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub version: i64,
}

impl RawBusinessRecord {
    /// First sighting of a business.
    pub fn from_new(new: NewRawRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: new.source,
            source_id: new.source_id,
            business_name: new.business_name,
            category: new.category,
            phone: new.phone,
            email: new.email,
            website: new.website,
            address_line: new.address_line,
            city: new.city,
            state: new.state,
            zip_code: new.zip_code,
            latitude: new.latitude,
            longitude: new.longitude,
            geocode_confidence: new.geocode_confidence,
            social_links: new.social_links,
            review_count: new.review_count,
            rating: new.rating,
            years_in_business: new.years_in_business,
            raw_data: new.raw_data,
            status: RawStatus::New,
            first_seen_at: now,
            last_updated_at: now,
            version: 0,
        }
    }

    /// Re-scrape: take the latest values, keep identity and first sighting.
    pub fn refresh_from(&mut self, new: NewRawRecord, now: DateTime<Utc>) {
        self.business_name = new.business_name;
        self.category = new.category;
        self.phone = new.phone;
        self.email = new.email;
        self.website = new.website;
        self.address_line = new.address_line;
        self.city = new.city;
        self.state = new.state;
        self.zip_code = new.zip_code;
        self.latitude = new.latitude;
        self.longitude = new.longitude;
        self.geocode_confidence = new.geocode_confidence;
        self.social_links = new.social_links;
        self.review_count = new.review_count;
        self.rating = new.rating;
        self.years_in_business = new.years_in_business;
        self.raw_data = new.raw_data;
        self.last_updated_at = now;
    }
}

// --- ICP signals ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcpCategory {
    Low,
    Medium,
    High,
}

text_enum!(IcpCategory {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Pure detector output. Two runs over the same record and detector version
/// serialize to the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcpAssessment {
    pub raw_record_id: Uuid,
    pub detector_version: String,
    /// SHA-256 over the record fields the detector reads; a re-scrape that
    /// changes any of them yields a new signal row.
    pub input_fingerprint: String,
    pub no_website: bool,
    pub unmappable_address: bool,
    pub mobile_business: bool,
    pub ghost_business: bool,
    pub address_complexity_score: i32,
    pub findability_score: i32,
    pub icp_score: i32,
    pub icp_category: IcpCategory,
    /// Human-readable contributors, in a fixed order.
    pub reasons: Vec<String>,
}

/// A persisted assessment. Rows are never updated; a new detector version is a new row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcpSignal {
    pub id: Uuid,
    #[serde(flatten)]
    pub assessment: IcpAssessment,
    pub created_at: DateTime<Utc>,
}

// --- Enriched leads (stage 2) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Enriched,
    Validated,
    Ready,
    Rejected,
}

text_enum!(LeadStatus {
    Enriched => "enriched",
    Validated => "validated",
    Ready => "ready",
    Rejected => "rejected",
});

impl LeadStatus {
    /// Forward-only: enriched → validated → ready. Rejection is reachable from
    /// any non-terminal state and is itself terminal.
    pub fn can_transition_to(self, to: LeadStatus) -> bool {
        matches!(
            (self, to),
            (LeadStatus::Enriched, LeadStatus::Validated)
                | (LeadStatus::Validated, LeadStatus::Ready)
                | (LeadStatus::Enriched, LeadStatus::Rejected)
                | (LeadStatus::Validated, LeadStatus::Rejected)
                | (LeadStatus::Ready, LeadStatus::Rejected)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LeadGrade {
    A,
    B,
    C,
    D,
}

impl LeadGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadGrade::A => "A",
            LeadGrade::B => "B",
            LeadGrade::C => "C",
            LeadGrade::D => "D",
        }
    }
}

impl std::fmt::Display for LeadGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LeadGrade {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(LeadGrade::A),
            "B" => Ok(LeadGrade::B),
            "C" => Ok(LeadGrade::C),
            "D" => Ok(LeadGrade::D),
            other => Err(PipelineError::DataValidation(format!(
                "unknown LeadGrade value: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLinks {
    pub facebook: Option<String>,
    pub instagram: Option<String>,
    pub other: Vec<String>,
}

impl SocialLinks {
    pub fn is_empty(&self) -> bool {
        self.facebook.is_none() && self.instagram.is_none() && self.other.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedLead {
    pub id: Uuid,
    pub raw_record_id: Uuid,
    pub business_name: String,
    pub category: Option<String>,
    /// Digits only, 7 to 15 long.
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub owner_name: Option<String>,
    pub social: SocialLinks,
    pub address_line: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub review_count: Option<i32>,
    pub rating: Option<f64>,
    pub years_in_business: Option<i32>,
    pub icp_score: i32,
    pub enrichment_confidence: f64,
    pub enrichment_sources: Vec<String>,
    pub lead_score: i32,
    pub lead_grade: LeadGrade,
    pub status: LeadStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// What one third-party enrichment provider could add about a business.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialEnrichment {
    pub provider: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub owner_name: Option<String>,
    #[serde(default)]
    pub social_links: Vec<String>,
    pub review_count: Option<i32>,
    pub rating: Option<f64>,
    pub years_in_business: Option<i32>,
}

impl PartialEnrichment {
    /// Number of populated fields, used to weigh the provider's contribution.
    pub fn field_count(&self) -> usize {
        [
            self.phone.is_some(),
            self.email.is_some(),
            self.website.is_some(),
            self.owner_name.is_some(),
            !self.social_links.is_empty(),
            self.review_count.is_some(),
            self.rating.is_some(),
            self.years_in_business.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

// --- Ghost profiles (stage 3) ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeoMetadata {
    pub meta_title: String,
    pub meta_description: String,
    pub canonical_path: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostalAddress {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "streetAddress", skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(rename = "addressLocality", skip_serializing_if = "Option::is_none")]
    pub address_locality: Option<String>,
    #[serde(rename = "addressRegion", skip_serializing_if = "Option::is_none")]
    pub address_region: Option<String>,
    #[serde(rename = "postalCode", skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
}

/// schema.org `LocalBusiness` JSON-LD block embedded in the public page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalBusinessJsonLd {
    #[serde(rename = "@context")]
    pub context: String,
    #[serde(rename = "@type")]
    pub kind: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telephone: Option<String>,
    pub address: PostalAddress,
    #[serde(rename = "sameAs", skip_serializing_if = "Vec::is_empty", default)]
    pub same_as: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostProfile {
    pub id: Uuid,
    pub enriched_lead_id: Uuid,
    pub slug: String,
    pub business_name: String,
    pub category: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub seo: SeoMetadata,
    pub schema_org: LocalBusinessJsonLd,
    pub is_claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub published_at: DateTime<Utc>,
    pub version: i64,
}

// --- Work queue ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

text_enum!(WorkStatus {
    Pending => "pending",
    Queued => "queued",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

/// Unique identity of a unit of scraping work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemKey {
    pub zip_code: String,
    pub state: String,
    pub source_type: SourceType,
    pub profession: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub key: WorkItemKey,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeQueueWorkItem {
    pub id: Uuid,
    pub key: WorkItemKey,
    pub status: WorkStatus,
    pub priority: i32,
    /// Monotonic; bumped on every claim. Completion reports carry it back.
    pub attempt: i32,
    pub consecutive_failures: i32,
    pub max_retries: i32,
    /// Set by a permanent source error; the item is never retried automatically.
    pub permanent_failure: bool,
    pub last_error: Option<String>,
    pub records_found: i32,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Row version for compare-and-set.
    pub version: i64,
}

impl ScrapeQueueWorkItem {
    /// Whether another automatic attempt is allowed after a failure.
    pub fn has_retries_left(&self) -> bool {
        !self.permanent_failure && self.consecutive_failures < self.max_retries
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, WorkStatus::Queued | WorkStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageResult {
    Succeeded,
    Failed,
    PermanentFailure,
    Deferred,
    TimedOut,
}

text_enum!(MessageResult {
    Succeeded => "succeeded",
    Failed => "failed",
    PermanentFailure => "permanent_failure",
    Deferred => "deferred",
    TimedOut => "timed_out",
});

/// Immutable audit row, one per dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub work_item_id: Uuid,
    pub attempt: i32,
    pub source_type: SourceType,
    pub dispatched_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub result: MessageResult,
    pub records_found: i32,
    pub error: Option<String>,
    /// Message of the previous attempt on the same item, if any.
    pub retry_of: Option<Uuid>,
}

// --- Rate limiting ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    Second,
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    pub const ALL: [RateWindow; 4] = [
        RateWindow::Second,
        RateWindow::Minute,
        RateWindow::Hour,
        RateWindow::Day,
    ];

    pub fn length(&self) -> chrono::Duration {
        match self {
            RateWindow::Second => chrono::Duration::seconds(1),
            RateWindow::Minute => chrono::Duration::minutes(1),
            RateWindow::Hour => chrono::Duration::hours(1),
            RateWindow::Day => chrono::Duration::days(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub source_type: SourceType,
    /// Finer-grained key within a source (API key, host, account).
    pub source_key: String,
    pub limits: crate::policy::RateLimits,
    pub second: WindowCounter,
    pub minute: WindowCounter,
    pub hour: WindowCounter,
    pub day: WindowCounter,
    pub is_throttled: bool,
    pub throttled_until: Option<DateTime<Utc>>,
    pub consecutive_errors: i32,
    pub total_requests: i64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl RateLimitBucket {
    pub fn new(
        source_type: SourceType,
        source_key: &str,
        limits: crate::policy::RateLimits,
        now: DateTime<Utc>,
    ) -> Self {
        let counter = |window: RateWindow| WindowCounter {
            count: 0,
            reset_at: now + window.length(),
        };
        Self {
            source_type,
            source_key: source_key.to_string(),
            limits,
            second: counter(RateWindow::Second),
            minute: counter(RateWindow::Minute),
            hour: counter(RateWindow::Hour),
            day: counter(RateWindow::Day),
            is_throttled: false,
            throttled_until: None,
            consecutive_errors: 0,
            total_requests: 0,
            last_request_at: None,
            version: 0,
        }
    }

    pub fn counter(&self, window: RateWindow) -> &WindowCounter {
        match window {
            RateWindow::Second => &self.second,
            RateWindow::Minute => &self.minute,
            RateWindow::Hour => &self.hour,
            RateWindow::Day => &self.day,
        }
    }

    pub fn counter_mut(&mut self, window: RateWindow) -> &mut WindowCounter {
        match window {
            RateWindow::Second => &mut self.second,
            RateWindow::Minute => &mut self.minute,
            RateWindow::Hour => &mut self.hour,
            RateWindow::Day => &mut self.day,
        }
    }
}

// --- Schedules ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    All,
    Priority,
    Failed,
    RandomSample,
}

text_enum!(SelectionStrategy {
    All => "all",
    Priority => "priority",
    Failed => "failed",
    RandomSample => "random_sample",
});

/// Which geography a schedule covers. Empty lists mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSelector {
    pub states: Vec<String>,
    pub zip_codes: Vec<String>,
}

impl TargetSelector {
    pub fn matches(&self, state: &str, zip_code: &str) -> bool {
        let state_ok = self.states.is_empty()
            || self.states.iter().any(|s| s.eq_ignore_ascii_case(state));
        let zip_ok = self.zip_codes.is_empty() || self.zip_codes.iter().any(|z| z == zip_code);
        state_ok && zip_ok
    }
}

/// One geographic unit a schedule can enqueue work for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub zip_code: String,
    pub state: String,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSchedule {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub source_type: SourceType,
    pub profession: String,
    pub target: TargetSelector,
    pub strategy: SelectionStrategy,
    pub zip_limit_per_run: u32,
    pub frequency_hours: u32,
    /// RFC 5545 recurrence (`DTSTART:...\nRRULE:...`); overrides `frequency_hours`.
    pub recurrence: Option<String>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub allowed_weekdays: Vec<Weekday>,
    pub max_concurrent: u32,
    pub delay_between_requests_ms: u64,
    pub priority: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_enqueued: i32,
    pub last_error: Option<String>,
    pub version: i64,
}
