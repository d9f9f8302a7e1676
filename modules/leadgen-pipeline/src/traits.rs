// Collaborator boundaries consumed by the pipeline.
//
// SourceFetcher: one call per work item against an external listing source.
// EnrichmentProvider: one call per raw record per third-party provider.
//
// Production implementations live in `adapters` (gateway-backed); tests use
// MockFetcher and MockEnrichment from `testing`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use leadgen_common::{NewRawRecord, PartialEnrichment, RawBusinessRecord, SourceType};

/// Geography and profession a work item asks a source about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub zip_code: String,
    pub state: String,
    pub profession: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Upstream told us to slow down (HTTP 429 or equivalent).
    #[error("rate limited by source")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, 5xx, timeout. Worth retrying.
    #[error("transient source error: {0}")]
    Transient(String),

    /// The target itself is bad (4xx on a malformed query). Not worth retrying.
    #[error("permanent source error: {0}")]
    Permanent(String),
}

// ---------------------------------------------------------------------------
// SourceFetcher
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        source_type: SourceType,
        target: &FetchTarget,
    ) -> Result<Vec<NewRawRecord>, FetchError>;
}

// ---------------------------------------------------------------------------
// EnrichmentProvider
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Provider name recorded in `enrichment_sources`.
    fn name(&self) -> &str;

    async fn enrich_external(&self, raw: &RawBusinessRecord) -> anyhow::Result<PartialEnrichment>;
}
