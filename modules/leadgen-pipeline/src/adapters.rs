//! Production collaborators backed by the listing gateway.

use std::sync::Arc;

use async_trait::async_trait;
use source_client::{EnrichInput, EnrichmentResult, GatewayClient, GatewayError, GatewayListing, SearchInput};

use leadgen_common::{NewRawRecord, PartialEnrichment, RawBusinessRecord, SourceType};

use crate::traits::{EnrichmentProvider, FetchError, FetchTarget, SourceFetcher};

/// Listings requested per search call.
const RESULTS_PER_SEARCH: u32 = 100;

// ---------------------------------------------------------------------------
// Source fetcher
// ---------------------------------------------------------------------------

pub struct GatewayFetcher {
    client: Arc<GatewayClient>,
}

impl GatewayFetcher {
    pub fn new(client: Arc<GatewayClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for GatewayFetcher {
    async fn fetch(
        &self,
        source_type: SourceType,
        target: &FetchTarget,
    ) -> Result<Vec<NewRawRecord>, FetchError> {
        let input = SearchInput {
            zip_code: target.zip_code.clone(),
            state: target.state.clone(),
            profession: target.profession.clone(),
            results_limit: RESULTS_PER_SEARCH,
        };
        let listings = self
            .client
            .search(source_type.as_str(), &input)
            .await
            .map_err(fetch_error)?;
        Ok(listings
            .into_iter()
            .map(|listing| listing_to_record(source_type, listing))
            .collect())
    }
}

pub fn fetch_error(err: GatewayError) -> FetchError {
    match err {
        GatewayError::RateLimited { retry_after_secs } => FetchError::RateLimited {
            retry_after: retry_after_secs.map(std::time::Duration::from_secs),
        },
        other if other.is_permanent() => FetchError::Permanent(other.to_string()),
        other => FetchError::Transient(other.to_string()),
    }
}

pub fn listing_to_record(source: SourceType, listing: GatewayListing) -> NewRawRecord {
    NewRawRecord {
        source,
        source_id: listing.source_id,
        business_name: listing.name,
        category: listing.category,
        phone: listing.phone,
        email: listing.email,
        website: listing.website,
        address_line: listing.address,
        city: listing.city,
        state: listing.state,
        zip_code: listing.postal_code,
        latitude: listing.latitude,
        longitude: listing.longitude,
        geocode_confidence: listing.geocode_confidence,
        social_links: listing.social_links,
        review_count: listing.review_count,
        rating: listing.rating,
        years_in_business: listing.years_in_business,
        raw_data: listing.raw,
    }
}

// ---------------------------------------------------------------------------
// Enrichment provider
// ---------------------------------------------------------------------------

/// The gateway fans out to its own providers; their answers are merged into
/// one partial, earlier providers winning each field.
pub struct GatewayEnrichment {
    client: Arc<GatewayClient>,
    name: String,
}

impl GatewayEnrichment {
    pub fn new(client: Arc<GatewayClient>, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }
}

#[async_trait]
impl EnrichmentProvider for GatewayEnrichment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enrich_external(&self, raw: &RawBusinessRecord) -> anyhow::Result<PartialEnrichment> {
        let input = EnrichInput {
            business_name: raw.business_name.clone(),
            phone: raw.phone.clone(),
            address: raw.address_line.clone(),
            city: raw.city.clone(),
            state: raw.state.clone(),
            postal_code: raw.zip_code.clone(),
        };
        let results = self.client.enrich(&input).await?;
        Ok(merge_results(&self.name, results))
    }
}

pub fn merge_results(name: &str, results: Vec<EnrichmentResult>) -> PartialEnrichment {
    let mut merged = PartialEnrichment {
        provider: name.to_string(),
        ..Default::default()
    };
    for r in results {
        merged.phone = merged.phone.or(r.phone);
        merged.email = merged.email.or(r.email);
        merged.website = merged.website.or(r.website);
        merged.owner_name = merged.owner_name.or(r.owner_name);
        merged.review_count = merged.review_count.or(r.review_count);
        merged.rating = merged.rating.or(r.rating);
        merged.years_in_business = merged.years_in_business.or(r.years_in_business);
        for link in r.social_links {
            if !merged.social_links.contains(&link) {
                merged.social_links.push(link);
            }
        }
    }
    merged
}
