//! Stage 1: validated, deduplicated raw business records.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use leadgen_common::{NewRawRecord, PipelineError, PipelineResult, RawBusinessRecord, RawStatus};

use crate::clock::Clock;
use crate::store::RawRecordStore;

static RE_ZIP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{5}(-\d{4})?$").unwrap());

pub struct IngestionService {
    store: Arc<dyn RawRecordStore>,
    clock: Arc<dyn Clock>,
}

impl IngestionService {
    pub fn new(store: Arc<dyn RawRecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate, then insert on first sighting or refresh in place on re-scrape.
    /// Invalid records are logged and never reach the store.
    pub async fn ingest(&self, record: NewRawRecord) -> PipelineResult<RawBusinessRecord> {
        let source = record.source;
        let source_id = record.source_id.clone();
        let record = match validate(record) {
            Ok(record) => record,
            Err(e) => {
                warn!(source = %source, source_id = %source_id, error = %e, "Rejected raw record");
                return Err(e);
            }
        };

        let (stored, created) = self.store.upsert_raw(record, self.clock.now()).await?;
        if created {
            info!(
                raw_record_id = %stored.id,
                source = %stored.source,
                source_id = %stored.source_id,
                "Raw record created"
            );
        } else {
            info!(
                raw_record_id = %stored.id,
                source = %stored.source,
                source_id = %stored.source_id,
                "Raw record refreshed"
            );
        }
        Ok(stored)
    }

    pub async fn mark_status(&self, raw_record_id: Uuid, status: RawStatus) -> PipelineResult<()> {
        self.store.set_raw_status(raw_record_id, status).await?;
        Ok(())
    }

    pub async fn get(&self, raw_record_id: Uuid) -> PipelineResult<RawBusinessRecord> {
        self.store
            .get_raw(raw_record_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("raw record {raw_record_id}")))
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Normalize whitespace and reject records that cannot be identified or placed.
pub fn validate(mut record: NewRawRecord) -> PipelineResult<NewRawRecord> {
    record.source_id = record.source_id.trim().to_string();
    record.business_name = record.business_name.trim().to_string();
    if record.source_id.is_empty() {
        return Err(PipelineError::DataValidation("source_id is empty".into()));
    }
    if record.business_name.is_empty() {
        return Err(PipelineError::DataValidation("business_name is empty".into()));
    }

    record.category = trimmed(record.category);
    record.phone = trimmed(record.phone);
    record.email = trimmed(record.email);
    record.website = trimmed(record.website);
    record.address_line = trimmed(record.address_line);
    record.city = trimmed(record.city);
    record.state = trimmed(record.state);
    record.zip_code = trimmed(record.zip_code);
    record.social_links.retain(|l| !l.trim().is_empty());

    if let Some(lat) = record.latitude {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(PipelineError::DataValidation(format!("latitude {lat} out of range")));
        }
    }
    if let Some(lng) = record.longitude {
        if !(-180.0..=180.0).contains(&lng) {
            return Err(PipelineError::DataValidation(format!("longitude {lng} out of range")));
        }
    }
    if let Some(conf) = record.geocode_confidence {
        if !(0.0..=1.0).contains(&conf) {
            return Err(PipelineError::DataValidation(format!(
                "geocode_confidence {conf} out of range"
            )));
        }
    }
    if let Some(zip) = &record.zip_code {
        if !RE_ZIP.is_match(zip) {
            return Err(PipelineError::DataValidation(format!("malformed zip code {zip:?}")));
        }
    }
    if let Some(rating) = record.rating {
        if !(0.0..=5.0).contains(&rating) {
            return Err(PipelineError::DataValidation(format!("rating {rating} out of range")));
        }
    }
    if record.review_count.is_some_and(|c| c < 0) {
        return Err(PipelineError::DataValidation("negative review_count".into()));
    }
    Ok(record)
}
