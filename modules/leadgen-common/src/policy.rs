//! Versioned scoring and throughput policy, loaded from TOML.
//!
//! Every weight the detector and lead scorer use lives here. Changing any
//! `[icp]` value must come with a new `detector_version`, since stored
//! signals are keyed by it.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{IcpCategory, LeadGrade, RateWindow, SourceType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelinePolicy {
    pub icp: IcpPolicy,
    pub lead: LeadPolicy,
    pub retry: RetryPolicy,
    /// Keyed by source type column value (`google_maps`, `yelp`, ...).
    pub rate_limits: BTreeMap<String, RateLimits>,
    /// Caps applied to sources without an explicit `[rate_limits.<source>]` table.
    pub default_rate_limits: RateLimits,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        let mut rate_limits = BTreeMap::new();
        rate_limits.insert(
            SourceType::GoogleMaps.as_str().to_string(),
            RateLimits {
                per_second: Some(5),
                per_minute: Some(60),
                per_hour: Some(1_000),
                per_day: Some(10_000),
            },
        );
        rate_limits.insert(
            SourceType::Yelp.as_str().to_string(),
            RateLimits {
                per_second: Some(2),
                per_minute: Some(30),
                per_hour: Some(500),
                per_day: Some(5_000),
            },
        );
        rate_limits.insert(
            SourceType::StateLicensing.as_str().to_string(),
            RateLimits {
                per_second: Some(1),
                per_minute: Some(20),
                per_hour: Some(300),
                per_day: Some(2_000),
            },
        );
        Self {
            icp: IcpPolicy::default(),
            lead: LeadPolicy::default(),
            retry: RetryPolicy::default(),
            rate_limits,
            default_rate_limits: RateLimits {
                per_second: Some(1),
                per_minute: Some(30),
                per_hour: Some(500),
                per_day: Some(5_000),
            },
        }
    }
}

impl PipelinePolicy {
    /// Load from a TOML file, or fall back to built-in defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let policy = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read policy file: {}", path.display()))?;
                Self::from_toml(&content)
                    .with_context(|| format!("Failed to parse policy file: {}", path.display()))?
            }
            None => Self::default(),
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let policy: Self = toml::from_str(content)?;
        Ok(policy)
    }

    pub fn rate_limits_for(&self, source_type: SourceType) -> RateLimits {
        self.rate_limits
            .get(source_type.as_str())
            .copied()
            .unwrap_or(self.default_rate_limits)
    }

    /// Reject policies whose thresholds are out of order or whose weights are negative.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let icp = &self.icp;
        if icp.detector_version.trim().is_empty() {
            return Err(PipelineError::Config("icp.detector_version is empty".into()));
        }
        let w = &icp.weights;
        let icp_weights = [
            w.no_website,
            w.unmappable_address,
            w.mobile_business,
            w.ghost_business,
            w.address_complexity,
            w.hard_to_find,
        ];
        if icp_weights.iter().any(|w| *w < 0.0) {
            return Err(PipelineError::Config("icp weights must be non-negative".into()));
        }
        if !(0 < icp.medium_threshold
            && icp.medium_threshold < icp.high_threshold
            && icp.high_threshold <= 100)
        {
            return Err(PipelineError::Config(
                "icp thresholds must satisfy 0 < medium < high <= 100".into(),
            ));
        }

        let lead = &self.lead;
        let lw = &lead.weights;
        if [lw.icp, lw.confidence, lw.reviews, lw.tenure]
            .iter()
            .any(|w| *w < 0.0)
        {
            return Err(PipelineError::Config("lead weights must be non-negative".into()));
        }
        if !(lead.grade_c < lead.grade_b && lead.grade_b < lead.grade_a && lead.grade_a <= 100) {
            return Err(PipelineError::Config(
                "lead grade thresholds must satisfy c < b < a <= 100".into(),
            ));
        }

        if self.retry.max_retries < 1 {
            return Err(PipelineError::Config("retry.max_retries must be at least 1".into()));
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(PipelineError::Config(
                "retry.base_delay_secs exceeds retry.max_delay_secs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(PipelineError::Config("retry.jitter_ratio must be in 0..=1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ICP detector policy
// ---------------------------------------------------------------------------

/// `icp_score = Σ weight × signal`, where boolean signals count 1 and the two
/// numeric ones are scaled to 0..1 (`address_complexity / 100` and
/// `(100 - findability) / 100`). All weights are non-negative, so every
/// "hard to find" signal can only raise the score. The defaults sum to 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IcpPolicy {
    pub detector_version: String,
    pub weights: IcpWeights,
    pub high_threshold: i32,
    pub medium_threshold: i32,
    /// Category substrings that indicate a service without a fixed location.
    pub mobile_categories: Vec<String>,
    /// Categories with many competing listings; anything else counts as niche.
    pub common_categories: Vec<String>,
    /// Hosts treated as social-only presence.
    pub social_hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IcpWeights {
    pub no_website: f64,
    pub unmappable_address: f64,
    pub mobile_business: f64,
    pub ghost_business: f64,
    pub address_complexity: f64,
    pub hard_to_find: f64,
}

impl Default for IcpWeights {
    fn default() -> Self {
        Self {
            no_website: 25.0,
            unmappable_address: 25.0,
            mobile_business: 10.0,
            ghost_business: 10.0,
            address_complexity: 10.0,
            hard_to_find: 20.0,
        }
    }
}

impl Default for IcpPolicy {
    fn default() -> Self {
        Self {
            detector_version: "icp-v1".to_string(),
            weights: IcpWeights::default(),
            high_threshold: 70,
            medium_threshold: 40,
            mobile_categories: [
                "mobile", "food truck", "handyman", "mobile mechanic", "pressure washing",
                "mobile detailing", "pest control", "locksmith", "mobile notary", "tutor",
                "dog walker", "house cleaning",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            common_categories: [
                "plumber", "plumbing", "electrician", "restaurant", "dentist", "hair salon",
                "auto repair", "hvac", "roofing", "landscaping", "cleaning",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            social_hosts: ["facebook.com", "fb.com", "instagram.com", "instagr.am"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl IcpPolicy {
    pub fn categorize(&self, icp_score: i32) -> IcpCategory {
        if icp_score >= self.high_threshold {
            IcpCategory::High
        } else if icp_score >= self.medium_threshold {
            IcpCategory::Medium
        } else {
            IcpCategory::Low
        }
    }
}

// ---------------------------------------------------------------------------
// Lead scoring policy
// ---------------------------------------------------------------------------

/// `lead_score = 100 × (w_icp × icp/100 + w_conf × confidence
///   + w_reviews × review_strength + w_tenure × tenure_strength)`,
/// with the four weights summing to 1 in the defaults. Review strength is
/// `min(count / review_saturation, 1) × rating / 5`; tenure strength is
/// `min(years / tenure_saturation_years, 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LeadPolicy {
    pub weights: LeadWeights,
    pub grade_a: i32,
    pub grade_b: i32,
    pub grade_c: i32,
    pub publishable_grades: Vec<LeadGrade>,
    pub review_saturation: i32,
    pub tenure_saturation_years: i32,
    /// Leads from signals below this category are rejected at enrichment.
    pub minimum_icp_category: IcpCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LeadWeights {
    pub icp: f64,
    pub confidence: f64,
    pub reviews: f64,
    pub tenure: f64,
}

impl Default for LeadWeights {
    fn default() -> Self {
        Self {
            icp: 0.6,
            confidence: 0.2,
            reviews: 0.1,
            tenure: 0.1,
        }
    }
}

impl Default for LeadPolicy {
    fn default() -> Self {
        Self {
            weights: LeadWeights::default(),
            grade_a: 80,
            grade_b: 65,
            grade_c: 50,
            publishable_grades: vec![LeadGrade::A, LeadGrade::B],
            review_saturation: 50,
            tenure_saturation_years: 10,
            minimum_icp_category: IcpCategory::Medium,
        }
    }
}

impl LeadPolicy {
    /// Monotonic bucketing: a higher score never yields a worse grade.
    pub fn grade(&self, lead_score: i32) -> LeadGrade {
        if lead_score >= self.grade_a {
            LeadGrade::A
        } else if lead_score >= self.grade_b {
            LeadGrade::B
        } else if lead_score >= self.grade_c {
            LeadGrade::C
        } else {
            LeadGrade::D
        }
    }

    pub fn is_publishable(&self, grade: LeadGrade) -> bool {
        self.publishable_grades.contains(&grade)
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Fraction of the delay added or removed at random.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_secs: 30,
            max_delay_secs: 3_600,
            jitter_ratio: 0.2,
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

/// Per-window request caps. `None` leaves that window uncapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimits {
    pub per_second: Option<u32>,
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
    pub per_day: Option<u32>,
}

impl RateLimits {
    pub fn limit(&self, window: RateWindow) -> Option<u32> {
        match window {
            RateWindow::Second => self.per_second,
            RateWindow::Minute => self.per_minute,
            RateWindow::Hour => self.per_hour,
            RateWindow::Day => self.per_day,
        }
    }
}
