pub mod error;
pub mod types;

pub use error::{GatewayError, Result};
pub use types::{EnrichInput, EnrichmentResult, GatewayListing, SearchInput};

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use types::ApiResponse;

/// Client for the listing gateway that fronts the external sources
/// (maps, licensing boards, review sites) and the enrichment providers.
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Search one source for businesses of a profession within a zip code.
    pub async fn search(&self, source_type: &str, input: &SearchInput) -> Result<Vec<GatewayListing>> {
        let url = format!("{}/v1/sources/{}/search", self.base_url, source_type);
        tracing::debug!(source_type, zip_code = %input.zip_code, profession = %input.profession, "Gateway search");
        self.post(&url, input).await
    }

    /// Ask the enrichment providers behind the gateway what they know about a business.
    pub async fn enrich(&self, input: &EnrichInput) -> Result<Vec<EnrichmentResult>> {
        let url = format!("{}/v1/enrich", self.base_url);
        self.post(&url, input).await
    }

    async fn post<I: Serialize, T: DeserializeOwned>(&self, url: &str, input: &I) -> Result<T> {
        let mut request = self.client.post(url).json(input);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(GatewayError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = resp.text().await?;
        let api_resp: ApiResponse<T> = serde_json::from_str(&body)?;
        Ok(api_resp.data)
    }
}
