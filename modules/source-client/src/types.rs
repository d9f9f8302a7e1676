use serde::{Deserialize, Serialize};

/// Envelope every gateway endpoint wraps its payload in.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

// --- Source search ---

/// Input for `POST /v1/sources/{source_type}/search`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchInput {
    pub zip_code: String,
    pub state: String,
    pub profession: String,
    #[serde(rename = "resultsLimit")]
    pub results_limit: u32,
}

/// A single business listing as the gateway returns it.
/// Everything except the id and name is optional; sources vary wildly.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayListing {
    #[serde(rename = "sourceId")]
    pub source_id: String,
    pub name: String,
    pub category: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "postalCode")]
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(rename = "geocodeConfidence")]
    pub geocode_confidence: Option<f64>,
    #[serde(rename = "socialLinks", default)]
    pub social_links: Vec<String>,
    #[serde(rename = "reviewCount")]
    pub review_count: Option<i32>,
    pub rating: Option<f64>,
    #[serde(rename = "yearsInBusiness")]
    pub years_in_business: Option<i32>,
    /// The untouched upstream document.
    #[serde(default)]
    pub raw: serde_json::Value,
}

// --- Enrichment ---

/// Input for `POST /v1/enrich`.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichInput {
    #[serde(rename = "businessName")]
    pub business_name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "postalCode")]
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnrichmentResult {
    pub provider: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    #[serde(rename = "ownerName")]
    pub owner_name: Option<String>,
    #[serde(rename = "socialLinks", default)]
    pub social_links: Vec<String>,
    #[serde(rename = "reviewCount")]
    pub review_count: Option<i32>,
    pub rating: Option<f64>,
    #[serde(rename = "yearsInBusiness")]
    pub years_in_business: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_parses_sparse_payload() {
        let body = r#"{"data":[{"sourceId":"abc123","name":"Joe's Plumbing","website":null,
            "address":"Calle 7 Int 4B","raw":{"place_id":"abc123"}}]}"#;
        let parsed: ApiResponse<Vec<GatewayListing>> = serde_json::from_str(body).unwrap();
        let listing = &parsed.data[0];
        assert_eq!(listing.source_id, "abc123");
        assert!(listing.website.is_none());
        assert!(listing.social_links.is_empty());
        assert_eq!(listing.raw["place_id"], "abc123");
    }
}
