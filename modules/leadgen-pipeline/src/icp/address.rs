//! Address heuristics: does a free-text address resolve to a standard street geocode?

use regex::Regex;
use std::sync::LazyLock;

// =============================================================================
// Regex Patterns
// =============================================================================

/// Sub-unit and informal markers ("Int 4B", "Depto 3", "Lote 12", "Mz 4").
static RE_SUBUNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(int|interior|depto|dept|apt|apto|unit|suite|ste|lote|lot|mz|manzana|local|piso|bldg|edificio)\b\.?",
    )
    .unwrap()
});

/// Kilometre and mile markers on rural roads.
static RE_KM_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(km\.?\s*\d+|kil[oó]metro\b|mile\s+marker\b)").unwrap()
});

static RE_LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+[a-zA-Z]?(-\d+)?\s+\S+").unwrap());

static RE_NUMBER_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\bno\.?|\bnum\.?|\bnúmero|#)\s*\d+").unwrap());

static RE_TRAILING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s\d+\s*$").unwrap());

// =============================================================================
// Analysis
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressTraits {
    pub missing: bool,
    pub token_count: usize,
    pub has_subunit: bool,
    pub has_km_marker: bool,
    pub has_street_number: bool,
}

impl AddressTraits {
    /// Not resolvable to a standard street geocode.
    pub fn is_unmappable(&self) -> bool {
        self.missing || self.has_subunit || self.has_km_marker || !self.has_street_number
    }
}

pub fn analyze(address: Option<&str>) -> AddressTraits {
    let Some(address) = address.map(str::trim).filter(|a| !a.is_empty()) else {
        return AddressTraits {
            missing: true,
            ..Default::default()
        };
    };
    AddressTraits {
        missing: false,
        token_count: address.split_whitespace().count(),
        has_subunit: RE_SUBUNIT.is_match(address),
        has_km_marker: RE_KM_MARKER.is_match(address),
        has_street_number: RE_LEADING_NUMBER.is_match(address)
            || RE_NUMBER_MARKER.is_match(address)
            || RE_TRAILING_NUMBER.is_match(address),
    }
}

/// 0..=100, higher is harder to geocode.
///
/// Long addresses add 4 per token past four (up to 20), a sub-unit marker adds
/// 30, a km marker 30, a missing street number 20, and low geocoder confidence
/// up to 20. A missing address scores 100.
pub fn complexity_score(traits: &AddressTraits, geocode_confidence: Option<f64>) -> i32 {
    if traits.missing {
        return 100;
    }
    let mut score = (traits.token_count.saturating_sub(4).min(5) * 4) as f64;
    if traits.has_subunit {
        score += 30.0;
    }
    if traits.has_km_marker {
        score += 30.0;
    }
    if !traits.has_street_number {
        score += 20.0;
    }
    score += (1.0 - geocode_confidence.unwrap_or(0.0).clamp(0.0, 1.0)) * 20.0;
    (score.round() as i32).clamp(0, 100)
}
