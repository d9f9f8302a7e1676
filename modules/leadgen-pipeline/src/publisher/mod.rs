//! Stage 3: promote ready, qualifying leads into public ghost profiles.
//!
//! A profile is written in one store call, SEO block included, so a failed
//! publish leaves nothing behind. Slugs are assigned once and never change.

pub mod seo;
pub mod slug;

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use leadgen_common::{
    EnrichedLead, GhostProfile, LeadPolicy, LeadStatus, PipelineError, PipelineResult,
};

use crate::clock::Clock;
use crate::store::{LeadStore, ProfileInsert, ProfileStore};

/// Numbered slugs re-derived after losing the insert to a concurrent publish.
const MAX_SLUG_RACES: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published(GhostProfile),
    /// The lead already had a profile; nothing was written.
    AlreadyPublished(GhostProfile),
}

impl PublishOutcome {
    pub fn profile(&self) -> &GhostProfile {
        match self {
            PublishOutcome::Published(p) | PublishOutcome::AlreadyPublished(p) => p,
        }
    }

    pub fn into_profile(self) -> GhostProfile {
        match self {
            PublishOutcome::Published(p) | PublishOutcome::AlreadyPublished(p) => p,
        }
    }
}

pub struct Publisher {
    leads: Arc<dyn LeadStore>,
    profiles: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    policy: LeadPolicy,
    public_base_url: String,
}

impl Publisher {
    pub fn new(
        leads: Arc<dyn LeadStore>,
        profiles: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
        policy: LeadPolicy,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            leads,
            profiles,
            clock,
            policy,
            public_base_url: public_base_url.into(),
        }
    }

    pub async fn publish(&self, lead_id: Uuid) -> PipelineResult<PublishOutcome> {
        let lead = self
            .leads
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("lead {lead_id}")))?;

        if let Some(existing) = self.profiles.profile_for_lead(lead.id).await? {
            debug!(lead_id = %lead.id, slug = %existing.slug, "Lead already published");
            return Ok(PublishOutcome::AlreadyPublished(existing));
        }
        if lead.status != LeadStatus::Ready {
            return Err(PipelineError::NotPublishable(format!(
                "lead {} is {}, not ready",
                lead.id, lead.status
            )));
        }
        if !self.policy.is_publishable(lead.lead_grade) {
            return Err(PipelineError::NotPublishable(format!(
                "lead {} has grade {}",
                lead.id, lead.lead_grade
            )));
        }

        let plan = slug::plan(&lead.business_name, lead.city.as_deref());
        for candidate in &plan.fixed {
            if self.profiles.profile_by_slug(candidate).await?.is_some() {
                continue;
            }
            if let Some(outcome) = self.insert(&lead, candidate.clone()).await? {
                return Ok(outcome);
            }
        }
        // Past the fixed names, the next counter comes from the highest one in use.
        for _ in 0..MAX_SLUG_RACES {
            let next = self
                .profiles
                .max_slug_suffix(&plan.stem)
                .await?
                .map_or(2, |n| n.max(1) + 1);
            if let Some(outcome) = self.insert(&lead, plan.numbered(next)).await? {
                return Ok(outcome);
            }
        }
        Err(PipelineError::Conflict(format!(
            "slug for lead {} kept being taken by concurrent publishes",
            lead.id
        )))
    }

    /// `None` when the slug went to another lead first.
    async fn insert(
        &self,
        lead: &EnrichedLead,
        slug: String,
    ) -> PipelineResult<Option<PublishOutcome>> {
        let profile = GhostProfile {
            id: Uuid::new_v4(),
            enriched_lead_id: lead.id,
            business_name: lead.business_name.clone(),
            category: lead.category.clone(),
            phone: lead.phone.clone(),
            city: lead.city.clone(),
            state: lead.state.clone(),
            zip_code: lead.zip_code.clone(),
            seo: seo::build_seo(lead, &slug),
            schema_org: seo::build_json_ld(lead, &self.public_base_url, &slug),
            is_claimed: false,
            claimed_at: None,
            claimed_by: None,
            published_at: self.clock.now(),
            version: 0,
            slug,
        };
        match self.profiles.insert_profile(profile).await? {
            ProfileInsert::Inserted(profile) => {
                info!(
                    lead_id = %lead.id,
                    profile_id = %profile.id,
                    slug = %profile.slug,
                    "Ghost profile published"
                );
                Ok(Some(PublishOutcome::Published(profile)))
            }
            ProfileInsert::AlreadyPublished(profile) => {
                Ok(Some(PublishOutcome::AlreadyPublished(profile)))
            }
            ProfileInsert::SlugTaken => {
                debug!(lead_id = %lead.id, "Slug taken concurrently, trying next");
                Ok(None)
            }
        }
    }

    /// One-time, irreversible claim by the business owner.
    pub async fn claim(&self, profile_id: Uuid, claimant: &str) -> PipelineResult<GhostProfile> {
        let claimant = claimant.trim();
        if claimant.is_empty() {
            return Err(PipelineError::DataValidation("claimant is empty".into()));
        }
        match self
            .profiles
            .claim_profile(profile_id, claimant, self.clock.now())
            .await?
        {
            Some(profile) => {
                info!(profile_id = %profile.id, slug = %profile.slug, "Ghost profile claimed");
                Ok(profile)
            }
            None => match self.profiles.get_profile(profile_id).await? {
                Some(_) => Err(PipelineError::AlreadyClaimed),
                None => Err(PipelineError::NotFound(format!("profile {profile_id}"))),
            },
        }
    }

    pub async fn profile_by_slug(&self, slug: &str) -> PipelineResult<Option<GhostProfile>> {
        Ok(self.profiles.profile_by_slug(slug).await?)
    }
}
