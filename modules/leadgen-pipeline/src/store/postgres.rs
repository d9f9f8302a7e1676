// Postgres implementation of every store trait.
//
// Unique keys are enforced by the schema (`ON CONFLICT`), compare-and-set is
// `UPDATE ... WHERE id = $1 AND version = $2`, and publishing a profile runs
// in one transaction.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use tracing::info;
use uuid::Uuid;

use leadgen_common::{
    EnrichedLead, GhostProfile, IcpAssessment, IcpSignal, LocalBusinessJsonLd, NewRawRecord,
    QueueMessage, RateLimitBucket, RateLimits, RawBusinessRecord, RawStatus, ScrapeQueueWorkItem,
    ScrapeSchedule, ScrapeTarget, SeoMetadata, SocialLinks, SourceType, TargetSelector,
    WindowCounter, WorkItemKey,
};

use super::{
    LeadStore, ProfileInsert, ProfileStore, QueueSummaryRow, RateLimitStore, RawRecordStore,
    RetryScope, ScheduleStore, TargetCatalog, WorkItemStore,
};

const MAX_CONNECTIONS: u32 = 10;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        info!("Lead pipeline schema up to date");
        Ok(())
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value).with_context(|| format!("{field} out of range: {value}"))
}

fn to_u32(value: i32, field: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("{field} is negative: {value}"))
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct RawRow {
    id: Uuid,
    source: String,
    source_id: String,
    business_name: String,
    category: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    website: Option<String>,
    address_line: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    geocode_confidence: Option<f64>,
    social_links: Vec<String>,
    review_count: Option<i32>,
    rating: Option<f64>,
    years_in_business: Option<i32>,
    raw_data: serde_json::Value,
    status: String,
    first_seen_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<RawRow> for RawBusinessRecord {
    type Error = anyhow::Error;

    fn try_from(r: RawRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            source: r.source.parse()?,
            source_id: r.source_id,
            business_name: r.business_name,
            category: r.category,
            phone: r.phone,
            email: r.email,
            website: r.website,
            address_line: r.address_line,
            city: r.city,
            state: r.state,
            zip_code: r.zip_code,
            latitude: r.latitude,
            longitude: r.longitude,
            geocode_confidence: r.geocode_confidence,
            social_links: r.social_links,
            review_count: r.review_count,
            rating: r.rating,
            years_in_business: r.years_in_business,
            raw_data: r.raw_data,
            status: r.status.parse()?,
            first_seen_at: r.first_seen_at,
            last_updated_at: r.last_updated_at,
            version: r.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UpsertedRawRow {
    #[sqlx(flatten)]
    row: RawRow,
    inserted: bool,
}

#[derive(sqlx::FromRow)]
struct SignalRow {
    id: Uuid,
    raw_record_id: Uuid,
    detector_version: String,
    input_fingerprint: String,
    no_website: bool,
    unmappable_address: bool,
    mobile_business: bool,
    ghost_business: bool,
    address_complexity_score: i32,
    findability_score: i32,
    icp_score: i32,
    icp_category: String,
    reasons: Vec<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SignalRow> for IcpSignal {
    type Error = anyhow::Error;

    fn try_from(r: SignalRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            assessment: IcpAssessment {
                raw_record_id: r.raw_record_id,
                detector_version: r.detector_version,
                input_fingerprint: r.input_fingerprint,
                no_website: r.no_website,
                unmappable_address: r.unmappable_address,
                mobile_business: r.mobile_business,
                ghost_business: r.ghost_business,
                address_complexity_score: r.address_complexity_score,
                findability_score: r.findability_score,
                icp_score: r.icp_score,
                icp_category: r.icp_category.parse()?,
                reasons: r.reasons,
            },
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeadRow {
    id: Uuid,
    raw_record_id: Uuid,
    business_name: String,
    category: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    website: Option<String>,
    owner_name: Option<String>,
    social: Json<SocialLinks>,
    address_line: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    review_count: Option<i32>,
    rating: Option<f64>,
    years_in_business: Option<i32>,
    icp_score: i32,
    enrichment_confidence: f64,
    enrichment_sources: Vec<String>,
    lead_score: i32,
    lead_grade: String,
    status: String,
    rejection_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<LeadRow> for EnrichedLead {
    type Error = anyhow::Error;

    fn try_from(r: LeadRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            raw_record_id: r.raw_record_id,
            business_name: r.business_name,
            category: r.category,
            phone: r.phone,
            email: r.email,
            website: r.website,
            owner_name: r.owner_name,
            social: r.social.0,
            address_line: r.address_line,
            city: r.city,
            state: r.state,
            zip_code: r.zip_code,
            review_count: r.review_count,
            rating: r.rating,
            years_in_business: r.years_in_business,
            icp_score: r.icp_score,
            enrichment_confidence: r.enrichment_confidence,
            enrichment_sources: r.enrichment_sources,
            lead_score: r.lead_score,
            lead_grade: r.lead_grade.parse()?,
            status: r.status.parse()?,
            rejection_reason: r.rejection_reason,
            created_at: r.created_at,
            updated_at: r.updated_at,
            version: r.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    enriched_lead_id: Uuid,
    slug: String,
    business_name: String,
    category: Option<String>,
    phone: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    seo: Json<SeoMetadata>,
    schema_org: Json<LocalBusinessJsonLd>,
    is_claimed: bool,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    published_at: DateTime<Utc>,
    version: i64,
}

impl From<ProfileRow> for GhostProfile {
    fn from(r: ProfileRow) -> Self {
        Self {
            id: r.id,
            enriched_lead_id: r.enriched_lead_id,
            slug: r.slug,
            business_name: r.business_name,
            category: r.category,
            phone: r.phone,
            city: r.city,
            state: r.state,
            zip_code: r.zip_code,
            seo: r.seo.0,
            schema_org: r.schema_org.0,
            is_claimed: r.is_claimed,
            claimed_at: r.claimed_at,
            claimed_by: r.claimed_by,
            published_at: r.published_at,
            version: r.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    zip_code: String,
    state: String,
    source_type: String,
    profession: String,
    status: String,
    priority: i32,
    attempt: i32,
    consecutive_failures: i32,
    max_retries: i32,
    permanent_failure: bool,
    last_error: Option<String>,
    records_found: i32,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<WorkItemRow> for ScrapeQueueWorkItem {
    type Error = anyhow::Error;

    fn try_from(r: WorkItemRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            key: WorkItemKey {
                zip_code: r.zip_code,
                state: r.state,
                source_type: r.source_type.parse()?,
                profession: r.profession,
            },
            status: r.status.parse()?,
            priority: r.priority,
            attempt: r.attempt,
            consecutive_failures: r.consecutive_failures,
            max_retries: r.max_retries,
            permanent_failure: r.permanent_failure,
            last_error: r.last_error,
            records_found: r.records_found,
            queued_at: r.queued_at,
            started_at: r.started_at,
            completed_at: r.completed_at,
            next_retry_at: r.next_retry_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
            version: r.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    work_item_id: Uuid,
    attempt: i32,
    source_type: String,
    dispatched_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: i64,
    result: String,
    records_found: i32,
    error: Option<String>,
    retry_of: Option<Uuid>,
}

impl TryFrom<MessageRow> for QueueMessage {
    type Error = anyhow::Error;

    fn try_from(r: MessageRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            work_item_id: r.work_item_id,
            attempt: r.attempt,
            source_type: r.source_type.parse()?,
            dispatched_at: r.dispatched_at,
            finished_at: r.finished_at,
            duration_ms: r.duration_ms,
            result: r.result.parse()?,
            records_found: r.records_found,
            error: r.error,
            retry_of: r.retry_of,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueHealthRow {
    source_type: String,
    status: String,
    count: i64,
    retryable: i64,
    oldest_queued_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct BucketRow {
    source_type: String,
    source_key: String,
    limits: Json<RateLimits>,
    second_count: i32,
    second_reset_at: DateTime<Utc>,
    minute_count: i32,
    minute_reset_at: DateTime<Utc>,
    hour_count: i32,
    hour_reset_at: DateTime<Utc>,
    day_count: i32,
    day_reset_at: DateTime<Utc>,
    is_throttled: bool,
    throttled_until: Option<DateTime<Utc>>,
    consecutive_errors: i32,
    total_requests: i64,
    last_request_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<BucketRow> for RateLimitBucket {
    type Error = anyhow::Error;

    fn try_from(r: BucketRow) -> Result<Self> {
        let counter = |count: i32, reset_at: DateTime<Utc>, field: &str| -> Result<WindowCounter> {
            Ok(WindowCounter {
                count: to_u32(count, field)?,
                reset_at,
            })
        };
        Ok(Self {
            source_type: r.source_type.parse()?,
            source_key: r.source_key,
            limits: r.limits.0,
            second: counter(r.second_count, r.second_reset_at, "second_count")?,
            minute: counter(r.minute_count, r.minute_reset_at, "minute_count")?,
            hour: counter(r.hour_count, r.hour_reset_at, "hour_count")?,
            day: counter(r.day_count, r.day_reset_at, "day_count")?,
            is_throttled: r.is_throttled,
            throttled_until: r.throttled_until,
            consecutive_errors: r.consecutive_errors,
            total_requests: r.total_requests,
            last_request_at: r.last_request_at,
            version: r.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    name: String,
    enabled: bool,
    source_type: String,
    profession: String,
    target: Json<TargetSelector>,
    strategy: String,
    zip_limit_per_run: i32,
    frequency_hours: i32,
    recurrence: Option<String>,
    start_time: NaiveTime,
    end_time: NaiveTime,
    allowed_weekdays: Vec<String>,
    max_concurrent: i32,
    delay_between_requests_ms: i64,
    priority: i32,
    next_run_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    last_run_enqueued: i32,
    last_error: Option<String>,
    version: i64,
}

impl TryFrom<ScheduleRow> for ScrapeSchedule {
    type Error = anyhow::Error;

    fn try_from(r: ScheduleRow) -> Result<Self> {
        let allowed_weekdays = r
            .allowed_weekdays
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| anyhow!("schedule {}: unknown weekday {d:?}", r.id))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: r.id,
            name: r.name,
            enabled: r.enabled,
            source_type: r.source_type.parse()?,
            profession: r.profession,
            target: r.target.0,
            strategy: r.strategy.parse()?,
            zip_limit_per_run: to_u32(r.zip_limit_per_run, "zip_limit_per_run")?,
            frequency_hours: to_u32(r.frequency_hours, "frequency_hours")?,
            recurrence: r.recurrence,
            start_time: r.start_time,
            end_time: r.end_time,
            allowed_weekdays,
            max_concurrent: to_u32(r.max_concurrent, "max_concurrent")?,
            delay_between_requests_ms: u64::try_from(r.delay_between_requests_ms)
                .context("delay_between_requests_ms is negative")?,
            priority: r.priority,
            next_run_at: r.next_run_at,
            last_run_at: r.last_run_at,
            last_run_enqueued: r.last_run_enqueued,
            last_error: r.last_error,
            version: r.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    zip_code: String,
    state: String,
    priority: i32,
}

// ---------------------------------------------------------------------------
// RawRecordStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RawRecordStore for PgStore {
    async fn upsert_raw(
        &self,
        record: NewRawRecord,
        now: DateTime<Utc>,
    ) -> Result<(RawBusinessRecord, bool)> {
        let row = sqlx::query_as::<_, UpsertedRawRow>(
            r#"
            INSERT INTO raw_business_records
                (id, source, source_id, business_name, category, phone, email, website,
                 address_line, city, state, zip_code, latitude, longitude, geocode_confidence,
                 social_links, review_count, rating, years_in_business, raw_data,
                 status, first_seen_at, last_updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, 'new', $21, $21, 0)
            ON CONFLICT (source, source_id) DO UPDATE SET
                business_name = EXCLUDED.business_name,
                category = EXCLUDED.category,
                phone = EXCLUDED.phone,
                email = EXCLUDED.email,
                website = EXCLUDED.website,
                address_line = EXCLUDED.address_line,
                city = EXCLUDED.city,
                state = EXCLUDED.state,
                zip_code = EXCLUDED.zip_code,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                geocode_confidence = EXCLUDED.geocode_confidence,
                social_links = EXCLUDED.social_links,
                review_count = EXCLUDED.review_count,
                rating = EXCLUDED.rating,
                years_in_business = EXCLUDED.years_in_business,
                raw_data = EXCLUDED.raw_data,
                last_updated_at = EXCLUDED.last_updated_at,
                version = raw_business_records.version + 1
            RETURNING *, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.source.as_str())
        .bind(&record.source_id)
        .bind(&record.business_name)
        .bind(&record.category)
        .bind(&record.phone)
        .bind(&record.email)
        .bind(&record.website)
        .bind(&record.address_line)
        .bind(&record.city)
        .bind(&record.state)
        .bind(&record.zip_code)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.geocode_confidence)
        .bind(&record.social_links)
        .bind(record.review_count)
        .bind(record.rating)
        .bind(record.years_in_business)
        .bind(&record.raw_data)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert raw record")?;

        Ok((RawBusinessRecord::try_from(row.row)?, row.inserted))
    }

    async fn get_raw(&self, id: Uuid) -> Result<Option<RawBusinessRecord>> {
        sqlx::query_as::<_, RawRow>("SELECT * FROM raw_business_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(RawBusinessRecord::try_from)
            .transpose()
    }

    async fn find_raw(&self, source: SourceType, source_id: &str) -> Result<Option<RawBusinessRecord>> {
        sqlx::query_as::<_, RawRow>(
            "SELECT * FROM raw_business_records WHERE source = $1 AND source_id = $2",
        )
        .bind(source.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?
        .map(RawBusinessRecord::try_from)
        .transpose()
    }

    async fn set_raw_status(&self, id: Uuid, status: RawStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE raw_business_records SET status = $2, version = version + 1 WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("raw record {id} not found"));
        }
        Ok(())
    }

    async fn insert_signal(&self, signal: IcpSignal) -> Result<IcpSignal> {
        let a = &signal.assessment;
        let inserted = sqlx::query_as::<_, SignalRow>(
            r#"
            INSERT INTO icp_signals
                (id, raw_record_id, detector_version, input_fingerprint, no_website,
                 unmappable_address, mobile_business, ghost_business, address_complexity_score,
                 findability_score, icp_score, icp_category, reasons, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (raw_record_id, detector_version, input_fingerprint) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(signal.id)
        .bind(a.raw_record_id)
        .bind(&a.detector_version)
        .bind(&a.input_fingerprint)
        .bind(a.no_website)
        .bind(a.unmappable_address)
        .bind(a.mobile_business)
        .bind(a.ghost_business)
        .bind(a.address_complexity_score)
        .bind(a.findability_score)
        .bind(a.icp_score)
        .bind(a.icp_category.as_str())
        .bind(&a.reasons)
        .bind(signal.created_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert ICP signal")?;

        let row = match inserted {
            Some(row) => row,
            None => sqlx::query_as::<_, SignalRow>(
                r#"
                SELECT * FROM icp_signals
                WHERE raw_record_id = $1 AND detector_version = $2 AND input_fingerprint = $3
                "#,
            )
            .bind(a.raw_record_id)
            .bind(&a.detector_version)
            .bind(&a.input_fingerprint)
            .fetch_one(&self.pool)
            .await?,
        };
        IcpSignal::try_from(row)
    }

    async fn latest_signal(&self, raw_record_id: Uuid) -> Result<Option<IcpSignal>> {
        sqlx::query_as::<_, SignalRow>(
            r#"
            SELECT * FROM icp_signals
            WHERE raw_record_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(raw_record_id)
        .fetch_optional(&self.pool)
        .await?
        .map(IcpSignal::try_from)
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// LeadStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LeadStore for PgStore {
    async fn insert_lead_if_absent(&self, lead: EnrichedLead) -> Result<(EnrichedLead, bool)> {
        let inserted = sqlx::query_as::<_, LeadRow>(
            r#"
            INSERT INTO enriched_leads
                (id, raw_record_id, business_name, category, phone, email, website, owner_name,
                 social, address_line, city, state, zip_code, review_count, rating,
                 years_in_business, icp_score, enrichment_confidence, enrichment_sources,
                 lead_score, lead_grade, status, rejection_reason, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, 0)
            ON CONFLICT (raw_record_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(lead.id)
        .bind(lead.raw_record_id)
        .bind(&lead.business_name)
        .bind(&lead.category)
        .bind(&lead.phone)
        .bind(&lead.email)
        .bind(&lead.website)
        .bind(&lead.owner_name)
        .bind(Json(&lead.social))
        .bind(&lead.address_line)
        .bind(&lead.city)
        .bind(&lead.state)
        .bind(&lead.zip_code)
        .bind(lead.review_count)
        .bind(lead.rating)
        .bind(lead.years_in_business)
        .bind(lead.icp_score)
        .bind(lead.enrichment_confidence)
        .bind(&lead.enrichment_sources)
        .bind(lead.lead_score)
        .bind(lead.lead_grade.as_str())
        .bind(lead.status.as_str())
        .bind(&lead.rejection_reason)
        .bind(lead.created_at)
        .bind(lead.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert enriched lead")?;

        match inserted {
            Some(row) => Ok((EnrichedLead::try_from(row)?, true)),
            None => {
                let existing = self
                    .lead_for_raw(lead.raw_record_id)
                    .await?
                    .ok_or_else(|| anyhow!("lead for raw record {} vanished", lead.raw_record_id))?;
                Ok((existing, false))
            }
        }
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<EnrichedLead>> {
        sqlx::query_as::<_, LeadRow>("SELECT * FROM enriched_leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(EnrichedLead::try_from)
            .transpose()
    }

    async fn lead_for_raw(&self, raw_record_id: Uuid) -> Result<Option<EnrichedLead>> {
        sqlx::query_as::<_, LeadRow>("SELECT * FROM enriched_leads WHERE raw_record_id = $1")
            .bind(raw_record_id)
            .fetch_optional(&self.pool)
            .await?
            .map(EnrichedLead::try_from)
            .transpose()
    }

    async fn update_lead(&self, lead: &EnrichedLead, expected_version: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE enriched_leads SET
                phone = $3, email = $4, website = $5, owner_name = $6, social = $7,
                review_count = $8, rating = $9, years_in_business = $10,
                enrichment_confidence = $11, enrichment_sources = $12,
                lead_score = $13, lead_grade = $14, status = $15, rejection_reason = $16,
                updated_at = $17, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(lead.id)
        .bind(expected_version)
        .bind(&lead.phone)
        .bind(&lead.email)
        .bind(&lead.website)
        .bind(&lead.owner_name)
        .bind(Json(&lead.social))
        .bind(lead.review_count)
        .bind(lead.rating)
        .bind(lead.years_in_business)
        .bind(lead.enrichment_confidence)
        .bind(&lead.enrichment_sources)
        .bind(lead.lead_score)
        .bind(lead.lead_grade.as_str())
        .bind(lead.status.as_str())
        .bind(&lead.rejection_reason)
        .bind(lead.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to update enriched lead")?;
        Ok(result.rows_affected() == 1)
    }
}

// ---------------------------------------------------------------------------
// ProfileStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ProfileStore for PgStore {
    async fn get_profile(&self, id: Uuid) -> Result<Option<GhostProfile>> {
        Ok(
            sqlx::query_as::<_, ProfileRow>("SELECT * FROM ghost_profiles WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .map(Into::into),
        )
    }

    async fn profile_for_lead(&self, lead_id: Uuid) -> Result<Option<GhostProfile>> {
        Ok(sqlx::query_as::<_, ProfileRow>(
            "SELECT * FROM ghost_profiles WHERE enriched_lead_id = $1",
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into))
    }

    async fn profile_by_slug(&self, slug: &str) -> Result<Option<GhostProfile>> {
        Ok(
            sqlx::query_as::<_, ProfileRow>("SELECT * FROM ghost_profiles WHERE slug = $1")
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?
                .map(Into::into),
        )
    }

    async fn max_slug_suffix(&self, stem: &str) -> Result<Option<u64>> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT max(substring(slug FROM char_length($1) + 2)::BIGINT)
            FROM ghost_profiles
            WHERE starts_with(slug, $1 || '-')
              AND substring(slug FROM char_length($1) + 2) ~ '^[1-9][0-9]{0,17}$'
            "#,
        )
        .bind(stem)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read slug suffixes")?;
        Ok(max.map(u64::try_from).transpose()?)
    }

    async fn insert_profile(&self, profile: GhostProfile) -> Result<ProfileInsert> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, ProfileRow>(
            r#"
            INSERT INTO ghost_profiles
                (id, enriched_lead_id, slug, business_name, category, phone, city, state,
                 zip_code, seo, schema_org, is_claimed, claimed_at, claimed_by, published_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, FALSE, NULL, NULL, $12, 0)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(profile.id)
        .bind(profile.enriched_lead_id)
        .bind(&profile.slug)
        .bind(&profile.business_name)
        .bind(&profile.category)
        .bind(&profile.phone)
        .bind(&profile.city)
        .bind(&profile.state)
        .bind(&profile.zip_code)
        .bind(Json(&profile.seo))
        .bind(Json(&profile.schema_org))
        .bind(profile.published_at)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to insert ghost profile")?;

        let outcome = match inserted {
            Some(row) => ProfileInsert::Inserted(row.into()),
            None => {
                let winner = sqlx::query_as::<_, ProfileRow>(
                    "SELECT * FROM ghost_profiles WHERE enriched_lead_id = $1",
                )
                .bind(profile.enriched_lead_id)
                .fetch_optional(&mut *tx)
                .await?;
                match winner {
                    Some(row) => ProfileInsert::AlreadyPublished(row.into()),
                    None => ProfileInsert::SlugTaken,
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn claim_profile(
        &self,
        id: Uuid,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GhostProfile>> {
        Ok(sqlx::query_as::<_, ProfileRow>(
            r#"
            UPDATE ghost_profiles
            SET is_claimed = TRUE, claimed_at = $2, claimed_by = $3, version = version + 1
            WHERE id = $1 AND claimed_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(claimant)
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into))
    }
}

// ---------------------------------------------------------------------------
// WorkItemStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkItemStore for PgStore {
    async fn insert_item_if_absent(
        &self,
        item: ScrapeQueueWorkItem,
    ) -> Result<(ScrapeQueueWorkItem, bool)> {
        let inserted = sqlx::query_as::<_, WorkItemRow>(
            r#"
            INSERT INTO scrape_queue_work_items
                (id, zip_code, state, source_type, profession, status, priority, attempt,
                 consecutive_failures, max_retries, permanent_failure, last_error, records_found,
                 queued_at, started_at, completed_at, next_retry_at, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, 0)
            ON CONFLICT (zip_code, state, source_type, profession) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(item.id)
        .bind(&item.key.zip_code)
        .bind(&item.key.state)
        .bind(item.key.source_type.as_str())
        .bind(&item.key.profession)
        .bind(item.status.as_str())
        .bind(item.priority)
        .bind(item.attempt)
        .bind(item.consecutive_failures)
        .bind(item.max_retries)
        .bind(item.permanent_failure)
        .bind(&item.last_error)
        .bind(item.records_found)
        .bind(item.queued_at)
        .bind(item.started_at)
        .bind(item.completed_at)
        .bind(item.next_retry_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert work item")?;

        match inserted {
            Some(row) => Ok((ScrapeQueueWorkItem::try_from(row)?, true)),
            None => {
                let existing = self
                    .find_item(&item.key)
                    .await?
                    .ok_or_else(|| anyhow!("work item for key {:?} vanished", item.key))?;
                Ok((existing, false))
            }
        }
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<ScrapeQueueWorkItem>> {
        sqlx::query_as::<_, WorkItemRow>("SELECT * FROM scrape_queue_work_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScrapeQueueWorkItem::try_from)
            .transpose()
    }

    async fn find_item(&self, key: &WorkItemKey) -> Result<Option<ScrapeQueueWorkItem>> {
        sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT * FROM scrape_queue_work_items
            WHERE zip_code = $1 AND state = $2 AND source_type = $3 AND profession = $4
            "#,
        )
        .bind(&key.zip_code)
        .bind(&key.state)
        .bind(key.source_type.as_str())
        .bind(&key.profession)
        .fetch_optional(&self.pool)
        .await?
        .map(ScrapeQueueWorkItem::try_from)
        .transpose()
    }

    async fn update_item(&self, item: &ScrapeQueueWorkItem, expected_version: i64) -> Result<bool> {
        write_item(&self.pool, item, expected_version).await
    }

    async fn queued_items(
        &self,
        source_type: SourceType,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>> {
        sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT * FROM scrape_queue_work_items
            WHERE status = 'queued' AND source_type = $1
            ORDER BY priority DESC, queued_at ASC NULLS LAST, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(source_type.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScrapeQueueWorkItem::try_from)
        .collect()
    }

    async fn due_retries(
        &self,
        scope: &RetryScope,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>> {
        let states: Vec<String> = scope
            .target
            .states
            .iter()
            .map(|s| s.to_ascii_uppercase())
            .collect();
        sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT * FROM scrape_queue_work_items
            WHERE status = 'failed'
              AND NOT permanent_failure
              AND consecutive_failures < max_retries
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND ($2::TEXT IS NULL OR source_type = $2)
              AND ($3::TEXT IS NULL OR profession = $3)
              AND (cardinality($4::TEXT[]) = 0 OR upper(state) = ANY($4))
              AND (cardinality($5::TEXT[]) = 0 OR zip_code = ANY($5))
            ORDER BY priority DESC, next_retry_at ASC NULLS FIRST, id ASC
            LIMIT $6
            "#,
        )
        .bind(now)
        .bind(scope.source_type.map(|t| t.as_str()))
        .bind(scope.profession.as_deref())
        .bind(&states)
        .bind(&scope.target.zip_codes)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScrapeQueueWorkItem::try_from)
        .collect()
    }

    async fn terminal_failures(&self, limit: usize) -> Result<Vec<ScrapeQueueWorkItem>> {
        sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT * FROM scrape_queue_work_items
            WHERE status = 'failed'
              AND (permanent_failure OR consecutive_failures >= max_retries)
            ORDER BY updated_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScrapeQueueWorkItem::try_from)
        .collect()
    }

    async fn stuck_items(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScrapeQueueWorkItem>> {
        sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT * FROM scrape_queue_work_items
            WHERE status = 'processing'
              AND (started_at IS NULL OR started_at <= $1)
            ORDER BY started_at ASC NULLS FIRST, id ASC
            LIMIT $2
            "#,
        )
        .bind(started_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScrapeQueueWorkItem::try_from)
        .collect()
    }

    async fn queue_summary(&self) -> Result<Vec<QueueSummaryRow>> {
        let rows = sqlx::query_as::<_, QueueHealthRow>(
            "SELECT * FROM queue_health ORDER BY source_type, status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(QueueSummaryRow {
                    source_type: r.source_type.parse()?,
                    status: r.status.parse()?,
                    count: r.count,
                    retryable: r.retryable,
                    oldest_queued_at: r.oldest_queued_at,
                })
            })
            .collect()
    }

    async fn complete_attempt(
        &self,
        item: &ScrapeQueueWorkItem,
        expected_version: i64,
        message: QueueMessage,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !write_item(&mut *tx, item, expected_version).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_message(&mut *tx, &message).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn messages_for(&self, work_item_id: Uuid) -> Result<Vec<QueueMessage>> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM queue_messages
            WHERE work_item_id = $1
            ORDER BY attempt ASC, finished_at ASC
            "#,
        )
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(QueueMessage::try_from)
        .collect()
    }
}

// Work item writes, shared by the plain CAS and the completion transaction.
async fn write_item<'e>(
    executor: impl PgExecutor<'e>,
    item: &ScrapeQueueWorkItem,
    expected_version: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE scrape_queue_work_items SET
            status = $3, priority = $4, attempt = $5, consecutive_failures = $6,
            max_retries = $7, permanent_failure = $8, last_error = $9, records_found = $10,
            queued_at = $11, started_at = $12, completed_at = $13, next_retry_at = $14,
            updated_at = $15, version = version + 1
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(item.id)
    .bind(expected_version)
    .bind(item.status.as_str())
    .bind(item.priority)
    .bind(item.attempt)
    .bind(item.consecutive_failures)
    .bind(item.max_retries)
    .bind(item.permanent_failure)
    .bind(&item.last_error)
    .bind(item.records_found)
    .bind(item.queued_at)
    .bind(item.started_at)
    .bind(item.completed_at)
    .bind(item.next_retry_at)
    .bind(item.updated_at)
    .execute(executor)
    .await
    .context("Failed to update work item")?;
    Ok(result.rows_affected() == 1)
}

async fn insert_message<'e>(executor: impl PgExecutor<'e>, message: &QueueMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO queue_messages
            (id, work_item_id, attempt, source_type, dispatched_at, finished_at,
             duration_ms, result, records_found, error, retry_of)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(message.id)
    .bind(message.work_item_id)
    .bind(message.attempt)
    .bind(message.source_type.as_str())
    .bind(message.dispatched_at)
    .bind(message.finished_at)
    .bind(message.duration_ms)
    .bind(message.result.as_str())
    .bind(message.records_found)
    .bind(&message.error)
    .bind(message.retry_of)
    .execute(executor)
    .await
    .context("Failed to append queue message")?;
    Ok(())
}


// ---------------------------------------------------------------------------
// RateLimitStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RateLimitStore for PgStore {
    async fn get_bucket(
        &self,
        source_type: SourceType,
        source_key: &str,
    ) -> Result<Option<RateLimitBucket>> {
        sqlx::query_as::<_, BucketRow>(
            "SELECT * FROM rate_limit_buckets WHERE source_type = $1 AND source_key = $2",
        )
        .bind(source_type.as_str())
        .bind(source_key)
        .fetch_optional(&self.pool)
        .await?
        .map(RateLimitBucket::try_from)
        .transpose()
    }

    async fn insert_bucket_if_absent(&self, bucket: RateLimitBucket) -> Result<RateLimitBucket> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_buckets
                (source_type, source_key, limits,
                 second_count, second_reset_at, minute_count, minute_reset_at,
                 hour_count, hour_reset_at, day_count, day_reset_at,
                 is_throttled, throttled_until, consecutive_errors, total_requests,
                 last_request_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 0)
            ON CONFLICT (source_type, source_key) DO NOTHING
            "#,
        )
        .bind(bucket.source_type.as_str())
        .bind(&bucket.source_key)
        .bind(Json(&bucket.limits))
        .bind(to_i32(bucket.second.count, "second_count")?)
        .bind(bucket.second.reset_at)
        .bind(to_i32(bucket.minute.count, "minute_count")?)
        .bind(bucket.minute.reset_at)
        .bind(to_i32(bucket.hour.count, "hour_count")?)
        .bind(bucket.hour.reset_at)
        .bind(to_i32(bucket.day.count, "day_count")?)
        .bind(bucket.day.reset_at)
        .bind(bucket.is_throttled)
        .bind(bucket.throttled_until)
        .bind(bucket.consecutive_errors)
        .bind(bucket.total_requests)
        .bind(bucket.last_request_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert rate limit bucket")?;

        self.get_bucket(bucket.source_type, &bucket.source_key)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "rate limit bucket {}:{} vanished",
                    bucket.source_type,
                    bucket.source_key
                )
            })
    }

    async fn update_bucket(&self, bucket: &RateLimitBucket, expected_version: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE rate_limit_buckets SET
                limits = $4,
                second_count = $5, second_reset_at = $6,
                minute_count = $7, minute_reset_at = $8,
                hour_count = $9, hour_reset_at = $10,
                day_count = $11, day_reset_at = $12,
                is_throttled = $13, throttled_until = $14, consecutive_errors = $15,
                total_requests = $16, last_request_at = $17,
                version = version + 1
            WHERE source_type = $1 AND source_key = $2 AND version = $3
            "#,
        )
        .bind(bucket.source_type.as_str())
        .bind(&bucket.source_key)
        .bind(expected_version)
        .bind(Json(&bucket.limits))
        .bind(to_i32(bucket.second.count, "second_count")?)
        .bind(bucket.second.reset_at)
        .bind(to_i32(bucket.minute.count, "minute_count")?)
        .bind(bucket.minute.reset_at)
        .bind(to_i32(bucket.hour.count, "hour_count")?)
        .bind(bucket.hour.reset_at)
        .bind(to_i32(bucket.day.count, "day_count")?)
        .bind(bucket.day.reset_at)
        .bind(bucket.is_throttled)
        .bind(bucket.throttled_until)
        .bind(bucket.consecutive_errors)
        .bind(bucket.total_requests)
        .bind(bucket.last_request_at)
        .execute(&self.pool)
        .await
        .context("Failed to update rate limit bucket")?;
        Ok(result.rows_affected() == 1)
    }

    async fn all_buckets(&self) -> Result<Vec<RateLimitBucket>> {
        sqlx::query_as::<_, BucketRow>(
            "SELECT * FROM rate_limit_buckets ORDER BY source_type, source_key",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RateLimitBucket::try_from)
        .collect()
    }
}

// ---------------------------------------------------------------------------
// ScheduleStore and TargetCatalog
// ---------------------------------------------------------------------------

#[async_trait]
impl ScheduleStore for PgStore {
    async fn insert_schedule(&self, s: ScrapeSchedule) -> Result<()> {
        let weekdays: Vec<String> = s.allowed_weekdays.iter().map(|d| d.to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO scrape_schedules
                (id, name, enabled, source_type, profession, target, strategy,
                 zip_limit_per_run, frequency_hours, recurrence, start_time, end_time,
                 allowed_weekdays, max_concurrent, delay_between_requests_ms, priority,
                 next_run_at, last_run_at, last_run_enqueued, last_error, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, 0)
            "#,
        )
        .bind(s.id)
        .bind(&s.name)
        .bind(s.enabled)
        .bind(s.source_type.as_str())
        .bind(&s.profession)
        .bind(Json(&s.target))
        .bind(s.strategy.as_str())
        .bind(to_i32(s.zip_limit_per_run, "zip_limit_per_run")?)
        .bind(to_i32(s.frequency_hours, "frequency_hours")?)
        .bind(&s.recurrence)
        .bind(s.start_time)
        .bind(s.end_time)
        .bind(&weekdays)
        .bind(to_i32(s.max_concurrent, "max_concurrent")?)
        .bind(i64::try_from(s.delay_between_requests_ms).context("delay_between_requests_ms")?)
        .bind(s.priority)
        .bind(s.next_run_at)
        .bind(s.last_run_at)
        .bind(s.last_run_enqueued)
        .bind(&s.last_error)
        .execute(&self.pool)
        .await
        .context("Failed to insert schedule")?;
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScrapeSchedule>> {
        sqlx::query_as::<_, ScheduleRow>("SELECT * FROM scrape_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScrapeSchedule::try_from)
            .transpose()
    }

    async fn all_schedules(&self) -> Result<Vec<ScrapeSchedule>> {
        sqlx::query_as::<_, ScheduleRow>("SELECT * FROM scrape_schedules ORDER BY name, id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ScrapeSchedule::try_from)
            .collect()
    }

    async fn update_schedule(&self, s: &ScrapeSchedule, expected_version: i64) -> Result<bool> {
        let weekdays: Vec<String> = s.allowed_weekdays.iter().map(|d| d.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE scrape_schedules SET
                name = $3, enabled = $4, profession = $5, target = $6, strategy = $7,
                zip_limit_per_run = $8, frequency_hours = $9, recurrence = $10,
                start_time = $11, end_time = $12, allowed_weekdays = $13, max_concurrent = $14,
                delay_between_requests_ms = $15, priority = $16, next_run_at = $17,
                last_run_at = $18, last_run_enqueued = $19, last_error = $20,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(s.id)
        .bind(expected_version)
        .bind(&s.name)
        .bind(s.enabled)
        .bind(&s.profession)
        .bind(Json(&s.target))
        .bind(s.strategy.as_str())
        .bind(to_i32(s.zip_limit_per_run, "zip_limit_per_run")?)
        .bind(to_i32(s.frequency_hours, "frequency_hours")?)
        .bind(&s.recurrence)
        .bind(s.start_time)
        .bind(s.end_time)
        .bind(&weekdays)
        .bind(to_i32(s.max_concurrent, "max_concurrent")?)
        .bind(i64::try_from(s.delay_between_requests_ms).context("delay_between_requests_ms")?)
        .bind(s.priority)
        .bind(s.next_run_at)
        .bind(s.last_run_at)
        .bind(s.last_run_enqueued)
        .bind(&s.last_error)
        .execute(&self.pool)
        .await
        .context("Failed to update schedule")?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl TargetCatalog for PgStore {
    async fn targets(&self, selector: &TargetSelector) -> Result<Vec<ScrapeTarget>> {
        let states: Vec<String> = selector.states.iter().map(|s| s.to_uppercase()).collect();
        let rows = sqlx::query_as::<_, TargetRow>(
            r#"
            SELECT zip_code, state, priority FROM zip_codes
            WHERE (cardinality($1::TEXT[]) = 0 OR upper(state) = ANY($1))
              AND (cardinality($2::TEXT[]) = 0 OR zip_code = ANY($2))
            ORDER BY zip_code
            "#,
        )
        .bind(&states)
        .bind(&selector.zip_codes)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ScrapeTarget {
                zip_code: r.zip_code,
                state: r.state,
                priority: r.priority,
            })
            .collect())
    }
}
