//! ICP signal detector.
//!
//! [`detect`] is a pure function of a raw record and the detector policy. The
//! same record under the same policy always yields the same assessment, down
//! to the order of `reasons`. [`IcpDetector`] persists assessments as
//! append-only signal rows.

pub mod address;

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use leadgen_common::{
    IcpAssessment, IcpPolicy, IcpSignal, PipelineError, PipelineResult, RawBusinessRecord,
    RawStatus,
};

use crate::clock::Clock;
use crate::store::RawRecordStore;

// ---------------------------------------------------------------------------
// Pure detection
// ---------------------------------------------------------------------------

pub fn detect(record: &RawBusinessRecord, policy: &IcpPolicy) -> IcpAssessment {
    let no_website = record
        .website
        .as_deref()
        .map_or(true, |w| w.trim().is_empty());

    let traits = address::analyze(record.address_line.as_deref());
    let unmappable_address = traits.is_unmappable();

    let category = record
        .category
        .as_deref()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty());
    let mobile_business = category.as_deref().is_some_and(|c| {
        policy
            .mobile_categories
            .iter()
            .any(|m| c.contains(m.as_str()))
    });
    let niche_category = category.as_deref().map_or(true, |c| {
        !policy
            .common_categories
            .iter()
            .any(|common| c.contains(common.as_str()))
    });

    let social_links: Vec<&str> = record
        .social_links
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let social_only = !social_links.is_empty()
        && social_links
            .iter()
            .all(|link| is_social_host(link, &policy.social_hosts));
    let ghost_business = no_website && social_only;

    let address_complexity_score = address::complexity_score(&traits, record.geocode_confidence);
    let findability_score = findability_score(FindabilityInputs {
        no_website,
        unmappable_address,
        mobile_business,
        niche_category,
        has_phone: record.phone.as_deref().is_some_and(|p| !p.trim().is_empty()),
        geocode_confidence: record.geocode_confidence,
        social_count: social_links.len(),
        review_count: record.review_count,
    });

    let w = &policy.weights;
    let flag = |b: bool| if b { 1.0 } else { 0.0 };
    let raw_score = w.no_website * flag(no_website)
        + w.unmappable_address * flag(unmappable_address)
        + w.mobile_business * flag(mobile_business)
        + w.ghost_business * flag(ghost_business)
        + w.address_complexity * address_complexity_score as f64 / 100.0
        + w.hard_to_find * (100 - findability_score) as f64 / 100.0;
    let icp_score = (raw_score.round() as i32).clamp(0, 100);

    let mut reasons = Vec::new();
    if no_website {
        reasons.push("no website listed".to_string());
    }
    if unmappable_address {
        reasons.push(unmappable_reason(&traits).to_string());
    }
    if mobile_business {
        reasons.push("category indicates a mobile service".to_string());
    }
    if ghost_business {
        reasons.push("presence limited to social profiles".to_string());
    }
    reasons.push(format!("address complexity {address_complexity_score}"));
    reasons.push(format!("findability {findability_score}"));

    IcpAssessment {
        raw_record_id: record.id,
        detector_version: policy.detector_version.clone(),
        input_fingerprint: input_fingerprint(record, &policy.detector_version),
        no_website,
        unmappable_address,
        mobile_business,
        ghost_business,
        address_complexity_score,
        findability_score,
        icp_score,
        icp_category: policy.categorize(icp_score),
        reasons,
    }
}

fn unmappable_reason(traits: &address::AddressTraits) -> &'static str {
    if traits.missing {
        "no address"
    } else if traits.has_km_marker {
        "address uses a km marker"
    } else if traits.has_subunit {
        "address uses an interior or lot marker"
    } else {
        "address lacks a street number"
    }
}

struct FindabilityInputs {
    no_website: bool,
    unmappable_address: bool,
    mobile_business: bool,
    niche_category: bool,
    has_phone: bool,
    geocode_confidence: Option<f64>,
    social_count: usize,
    review_count: Option<i32>,
}

/// 0..=100, lower is harder to find. Starts at 100 and loses points for each
/// missing discovery channel; social profiles and reviews win a few back.
fn findability_score(i: FindabilityInputs) -> i32 {
    let mut score = 100.0;
    if i.no_website {
        score -= 30.0;
    }
    if i.unmappable_address {
        score -= 20.0;
    }
    if i.mobile_business {
        score -= 10.0;
    }
    if !i.has_phone {
        score -= 10.0;
    }
    score -= 15.0 * (1.0 - i.geocode_confidence.unwrap_or(0.0).clamp(0.0, 1.0));
    if i.niche_category {
        score -= 10.0;
    }
    score += (i.social_count.min(2) * 5) as f64;
    if i.review_count.unwrap_or(0) >= 10 {
        score += 10.0;
    }
    (score.round() as i32).clamp(0, 100)
}

pub(crate) fn host_of(url: &str) -> String {
    let lower = url.trim().to_lowercase();
    let without_scheme = lower.split_once("://").map_or(lower.as_str(), |(_, rest)| rest);
    let host = without_scheme
        .split(['/', '?', '#', ':'])
        .next()
        .unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

pub(crate) fn is_social_host(url: &str, social_hosts: &[String]) -> bool {
    let host = host_of(url);
    social_hosts
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{h}")))
}

/// SHA-256 over every field [`detect`] reads plus the detector version.
pub fn input_fingerprint(record: &RawBusinessRecord, detector_version: &str) -> String {
    let mut hasher = Sha256::new();
    let mut field = |name: &str, value: &str| {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    };
    field("detector_version", detector_version);
    field("website", record.website.as_deref().unwrap_or(""));
    field("address_line", record.address_line.as_deref().unwrap_or(""));
    field("category", record.category.as_deref().unwrap_or(""));
    field("phone", record.phone.as_deref().unwrap_or(""));
    field(
        "geocode_confidence",
        &record
            .geocode_confidence
            .map(|c| format!("{c:.6}"))
            .unwrap_or_default(),
    );
    field("social_links", &record.social_links.join("\u{1f}"));
    field(
        "review_count",
        &record.review_count.map(|c| c.to_string()).unwrap_or_default(),
    );
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

pub struct IcpDetector {
    store: Arc<dyn RawRecordStore>,
    clock: Arc<dyn Clock>,
    policy: IcpPolicy,
}

impl IcpDetector {
    pub fn new(store: Arc<dyn RawRecordStore>, clock: Arc<dyn Clock>, policy: IcpPolicy) -> Self {
        Self { store, clock, policy }
    }

    pub fn policy(&self) -> &IcpPolicy {
        &self.policy
    }

    /// Detect and persist. Re-scoring unchanged input returns the stored row.
    /// A record seen for the first time moves from `new` to `processed`.
    pub async fn score_record(&self, record: &RawBusinessRecord) -> PipelineResult<IcpSignal> {
        let assessment = detect(record, &self.policy);
        let signal = IcpSignal {
            id: Uuid::new_v4(),
            assessment,
            created_at: self.clock.now(),
        };
        let stored = self.store.insert_signal(signal.clone()).await?;
        if stored.id == signal.id {
            info!(
                raw_record_id = %record.id,
                detector_version = %stored.assessment.detector_version,
                icp_score = stored.assessment.icp_score,
                icp_category = %stored.assessment.icp_category,
                "ICP signal recorded"
            );
        } else {
            debug!(raw_record_id = %record.id, "ICP signal unchanged");
        }
        if record.status == RawStatus::New {
            self.store.set_raw_status(record.id, RawStatus::Processed).await?;
        }
        Ok(stored)
    }

    pub async fn score_by_id(&self, raw_record_id: Uuid) -> PipelineResult<IcpSignal> {
        let record = self
            .store
            .get_raw(raw_record_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("raw record {raw_record_id}")))?;
        self.score_record(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use leadgen_common::{IcpCategory, NewRawRecord, SourceType};

    fn record(new: NewRawRecord) -> RawBusinessRecord {
        RawBusinessRecord::from_new(new, Utc::now())
    }

    fn joes() -> RawBusinessRecord {
        record(
            NewRawRecord::builder()
                .source(SourceType::GoogleMaps)
                .source_id("abc123")
                .business_name("Joe's Plumbing")
                .address_line("Calle 7 Int 4B")
                .build(),
        )
    }

    #[test]
    fn hard_to_find_business_scores_high() {
        let a = detect(&joes(), &IcpPolicy::default());
        assert!(a.no_website);
        assert!(a.unmappable_address);
        assert!(!a.ghost_business);
        assert_eq!(a.address_complexity_score, 70);
        assert_eq!(a.findability_score, 15);
        assert_eq!(a.icp_score, 74);
        assert_eq!(a.icp_category, IcpCategory::High);
    }

    #[test]
    fn detection_is_idempotent() {
        let rec = joes();
        let policy = IcpPolicy::default();
        let first = serde_json::to_vec(&detect(&rec, &policy)).unwrap();
        let second = serde_json::to_vec(&detect(&rec, &policy)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn social_only_presence_is_ghost() {
        let rec = record(
            NewRawRecord::builder()
                .source(SourceType::Facebook)
                .source_id("fb-1")
                .business_name("Tacos Lupita")
                .category("food truck")
                .social_links(vec![
                    "https://www.facebook.com/tacoslupita".into(),
                    "https://instagram.com/tacoslupita".into(),
                ])
                .build(),
        );
        let a = detect(&rec, &IcpPolicy::default());
        assert!(a.ghost_business);
        assert!(a.mobile_business);
    }

    #[test]
    fn independent_site_in_links_is_not_ghost() {
        let rec = record(
            NewRawRecord::builder()
                .source(SourceType::Yelp)
                .source_id("y-1")
                .business_name("Ana's Salon")
                .social_links(vec![
                    "https://facebook.com/anas".into(),
                    "https://anassalon.example".into(),
                ])
                .build(),
        );
        assert!(!detect(&rec, &IcpPolicy::default()).ghost_business);
    }

    #[test]
    fn score_is_monotonic_in_hard_to_find_signals() {
        let policy = IcpPolicy::default();
        let findable = record(
            NewRawRecord::builder()
                .source(SourceType::GoogleMaps)
                .source_id("g-2")
                .business_name("Congress Plumbing")
                .website(Some("https://congressplumbing.example".to_string()))
                .category("plumber")
                .phone("5125550100")
                .address_line("1200 Congress Ave")
                .geocode_confidence(0.95)
                .build(),
        );
        let mut no_site = findable.clone();
        no_site.website = None;
        let mut no_site_bad_address = no_site.clone();
        no_site_bad_address.address_line = Some("Lote 12 Mz 4".into());

        let s1 = detect(&findable, &policy).icp_score;
        let s2 = detect(&no_site, &policy).icp_score;
        let s3 = detect(&no_site_bad_address, &policy).icp_score;
        assert!(s1 < s2 && s2 < s3, "{s1} {s2} {s3}");
        assert_eq!(policy.categorize(s1), IcpCategory::Low);
    }

    #[test]
    fn fingerprint_tracks_detector_inputs_only() {
        let rec = joes();
        let mut renamed = rec.clone();
        renamed.business_name = "Joe's Plumbing & Drains".into();
        assert_eq!(
            input_fingerprint(&rec, "icp-v1"),
            input_fingerprint(&renamed, "icp-v1")
        );

        let mut phoned = rec.clone();
        phoned.phone = Some("5125550100".into());
        assert_ne!(
            input_fingerprint(&rec, "icp-v1"),
            input_fingerprint(&phoned, "icp-v1")
        );
        assert_ne!(
            input_fingerprint(&rec, "icp-v1"),
            input_fingerprint(&rec, "icp-v2")
        );
    }
}
