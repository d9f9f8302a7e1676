//! Stage 2: raw record + ICP signal → one enriched lead.
//!
//! Exactly one lead exists per raw record. Concurrent enrichments of the same
//! record race on the store's unique guard and the loser adopts the winner's
//! row. Lead status only moves forward, except for a terminal rejection that
//! always carries a reason.

pub mod contact;
pub mod scoring;

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use leadgen_common::{
    EnrichedLead, IcpSignal, LeadPolicy, LeadStatus, PartialEnrichment, PipelineError,
    PipelineResult, RawBusinessRecord, RawStatus,
};

use crate::clock::Clock;
use crate::store::{LeadStore, RawRecordStore};
use crate::traits::EnrichmentProvider;

use scoring::BusinessSignals;

const MAX_CAS_ATTEMPTS: usize = 8;

pub const REASON_LOW_ICP: &str = "icp category below publishing minimum";
pub const REASON_NO_CONTACT: &str = "no reachable contact channel";

pub struct EnrichmentService {
    raw_store: Arc<dyn RawRecordStore>,
    leads: Arc<dyn LeadStore>,
    providers: Vec<Arc<dyn EnrichmentProvider>>,
    clock: Arc<dyn Clock>,
    policy: LeadPolicy,
}

impl EnrichmentService {
    pub fn new(
        raw_store: Arc<dyn RawRecordStore>,
        leads: Arc<dyn LeadStore>,
        providers: Vec<Arc<dyn EnrichmentProvider>>,
        clock: Arc<dyn Clock>,
        policy: LeadPolicy,
    ) -> Self {
        Self {
            raw_store,
            leads,
            providers,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &LeadPolicy {
        &self.policy
    }

    // ---------------------------------------------------------------------------
    // Enrich
    // ---------------------------------------------------------------------------

    /// Build the lead for `raw`, or return the one that already exists.
    /// Leads whose signal falls below the minimum ICP category are stored
    /// and immediately rejected, so the record is not enriched again.
    pub async fn enrich(
        &self,
        raw: &RawBusinessRecord,
        signal: &IcpSignal,
    ) -> PipelineResult<EnrichedLead> {
        if signal.assessment.raw_record_id != raw.id {
            return Err(PipelineError::DataValidation(format!(
                "signal {} belongs to raw record {}, not {}",
                signal.id, signal.assessment.raw_record_id, raw.id
            )));
        }
        if let Some(existing) = self.leads.lead_for_raw(raw.id).await? {
            debug!(raw_record_id = %raw.id, lead_id = %existing.id, "Lead already exists");
            return Ok(existing);
        }

        let partials = self.consult_providers(raw).await;
        let lead = self.build_lead(raw, signal, &partials);

        let (lead, created) = self.leads.insert_lead_if_absent(lead).await?;
        if !created {
            debug!(raw_record_id = %raw.id, lead_id = %lead.id, "Concurrent enrichment won the race");
            return Ok(lead);
        }
        info!(
            raw_record_id = %raw.id,
            lead_id = %lead.id,
            lead_score = lead.lead_score,
            lead_grade = %lead.lead_grade,
            enrichment_confidence = lead.enrichment_confidence,
            "Lead enriched"
        );
        self.raw_store.set_raw_status(raw.id, RawStatus::Enriched).await?;

        if signal.assessment.icp_category < self.policy.minimum_icp_category {
            return self.reject(lead.id, REASON_LOW_ICP).await;
        }
        Ok(lead)
    }

    /// Enrich many records concurrently. One record failing never affects the rest.
    pub async fn enrich_batch(
        &self,
        records: &[(RawBusinessRecord, IcpSignal)],
    ) -> Vec<(Uuid, PipelineResult<EnrichedLead>)> {
        let futures = records.iter().map(|(raw, signal)| async move {
            let result = self.enrich(raw, signal).await;
            if let Err(e) = &result {
                warn!(raw_record_id = %raw.id, error = %e, "Enrichment failed for record");
            }
            (raw.id, result)
        });
        join_all(futures).await
    }

    async fn consult_providers(&self, raw: &RawBusinessRecord) -> Vec<PartialEnrichment> {
        let calls = self.providers.iter().map(|provider| async move {
            match provider.enrich_external(raw).await {
                Ok(mut partial) => {
                    if partial.provider.is_empty() {
                        partial.provider = provider.name().to_string();
                    }
                    Some(partial)
                }
                Err(e) => {
                    warn!(
                        raw_record_id = %raw.id,
                        provider = provider.name(),
                        error = %e,
                        "Enrichment provider failed"
                    );
                    None
                }
            }
        });
        join_all(calls).await.into_iter().flatten().collect()
    }

    /// Raw values win; providers fill the remaining gaps in registration order.
    fn build_lead(
        &self,
        raw: &RawBusinessRecord,
        signal: &IcpSignal,
        partials: &[PartialEnrichment],
    ) -> EnrichedLead {
        let phone = pick_first(
            raw.phone.as_ref(),
            partials.iter().filter_map(|p| p.phone.as_ref()),
            contact::normalize_phone,
        );
        let email = pick_first(
            raw.email.as_ref(),
            partials.iter().filter_map(|p| p.email.as_ref()),
            contact::normalize_email,
        );
        let website = pick_first(
            raw.website.as_ref(),
            partials.iter().filter_map(|p| p.website.as_ref()),
            contact::normalize_url,
        );
        let owner_name = partials
            .iter()
            .filter_map(|p| p.owner_name.as_deref())
            .map(str::trim)
            .find(|n| !n.is_empty())
            .map(str::to_string);
        let social = contact::classify_social(
            raw.social_links
                .iter()
                .chain(partials.iter().flat_map(|p| p.social_links.iter())),
        );

        let review_count = raw
            .review_count
            .or_else(|| partials.iter().find_map(|p| p.review_count));
        let rating = raw.rating.or_else(|| partials.iter().find_map(|p| p.rating));
        let years_in_business = raw
            .years_in_business
            .or_else(|| partials.iter().find_map(|p| p.years_in_business));

        let confidence = scoring::enrichment_confidence(partials, self.providers.len());
        let lead_score = scoring::lead_score(
            signal.assessment.icp_score,
            confidence,
            BusinessSignals {
                review_count,
                rating,
                years_in_business,
            },
            &self.policy,
        );

        let now = self.clock.now();
        EnrichedLead {
            id: Uuid::new_v4(),
            raw_record_id: raw.id,
            business_name: raw.business_name.clone(),
            category: raw.category.clone(),
            phone,
            email,
            website,
            owner_name,
            social,
            address_line: raw.address_line.clone(),
            city: raw.city.clone(),
            state: raw.state.clone(),
            zip_code: raw.zip_code.clone(),
            review_count,
            rating,
            years_in_business,
            icp_score: signal.assessment.icp_score,
            enrichment_confidence: confidence,
            enrichment_sources: partials.iter().map(|p| p.provider.clone()).collect(),
            lead_score,
            lead_grade: self.policy.grade(lead_score),
            status: LeadStatus::Enriched,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    // ---------------------------------------------------------------------------
    // Status transitions
    // ---------------------------------------------------------------------------

    /// `enriched → validated` when the lead has a phone or email; otherwise the
    /// lead is rejected and returned in that state.
    pub async fn validate(&self, lead_id: Uuid) -> PipelineResult<EnrichedLead> {
        let lead = self.get(lead_id).await?;
        if lead.phone.is_none() && lead.email.is_none() {
            return self.reject(lead_id, REASON_NO_CONTACT).await;
        }
        self.advance(lead_id, LeadStatus::Validated, None).await
    }

    pub async fn mark_ready(&self, lead_id: Uuid) -> PipelineResult<EnrichedLead> {
        self.advance(lead_id, LeadStatus::Ready, None).await
    }

    pub async fn reject(&self, lead_id: Uuid, reason: &str) -> PipelineResult<EnrichedLead> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(PipelineError::DataValidation(
                "rejecting a lead requires a reason".into(),
            ));
        }
        let lead = self
            .advance(lead_id, LeadStatus::Rejected, Some(reason.to_string()))
            .await?;
        self.raw_store
            .set_raw_status(lead.raw_record_id, RawStatus::Rejected)
            .await?;
        Ok(lead)
    }

    pub async fn get(&self, lead_id: Uuid) -> PipelineResult<EnrichedLead> {
        self.leads
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("lead {lead_id}")))
    }

    async fn advance(
        &self,
        lead_id: Uuid,
        to: LeadStatus,
        reason: Option<String>,
    ) -> PipelineResult<EnrichedLead> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let lead = self.get(lead_id).await?;
            if !lead.status.can_transition_to(to) {
                return Err(PipelineError::InvalidLeadTransition(format!(
                    "{} -> {} for lead {lead_id}",
                    lead.status, to
                )));
            }
            let expected = lead.version;
            let mut updated = lead;
            updated.status = to;
            updated.updated_at = self.clock.now();
            if reason.is_some() {
                updated.rejection_reason = reason.clone();
            }
            if self.leads.update_lead(&updated, expected).await? {
                updated.version = expected + 1;
                match &updated.rejection_reason {
                    Some(reason) if to == LeadStatus::Rejected => {
                        info!(lead_id = %lead_id, reason = %reason, "Lead rejected")
                    }
                    _ => info!(lead_id = %lead_id, status = %to, "Lead status advanced"),
                }
                return Ok(updated);
            }
        }
        Err(PipelineError::Conflict(format!(
            "lead {lead_id} kept changing while moving to {to}"
        )))
    }
}

/// First value that survives normalization, raw record before providers.
fn pick_first<'a>(
    raw: Option<&'a String>,
    provided: impl Iterator<Item = &'a String>,
    normalize: fn(&str) -> Option<String>,
) -> Option<String> {
    raw.into_iter().chain(provided).find_map(|v| normalize(v))
}
