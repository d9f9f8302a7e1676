use leadgen_common::{LeadPolicy, PartialEnrichment};

/// A provider that fills this many fields counts as a full-confidence source.
const FIELDS_FOR_FULL_CREDIT: f64 = 4.0;

/// Mean per-provider credit over every provider consulted, so a provider that
/// failed or returned nothing pulls confidence down. Always in `0.0..=1.0`.
pub fn enrichment_confidence(partials: &[PartialEnrichment], providers_consulted: usize) -> f64 {
    if providers_consulted == 0 {
        return 0.0;
    }
    let credit: f64 = partials
        .iter()
        .map(|p| (p.field_count() as f64 / FIELDS_FOR_FULL_CREDIT).min(1.0))
        .sum();
    (credit / providers_consulted as f64).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusinessSignals {
    pub review_count: Option<i32>,
    pub rating: Option<f64>,
    pub years_in_business: Option<i32>,
}

/// See [`LeadPolicy`] for the formula. Result is rounded into `0..=100`.
pub fn lead_score(
    icp_score: i32,
    confidence: f64,
    business: BusinessSignals,
    policy: &LeadPolicy,
) -> i32 {
    let w = &policy.weights;
    let review_volume = business.review_count.unwrap_or(0).max(0) as f64
        / policy.review_saturation.max(1) as f64;
    let review_strength =
        review_volume.min(1.0) * business.rating.unwrap_or(0.0).clamp(0.0, 5.0) / 5.0;
    let tenure_strength = (business.years_in_business.unwrap_or(0).max(0) as f64
        / policy.tenure_saturation_years.max(1) as f64)
        .min(1.0);

    let score = 100.0
        * (w.icp * icp_score.clamp(0, 100) as f64 / 100.0
            + w.confidence * confidence.clamp(0.0, 1.0)
            + w.reviews * review_strength
            + w.tenure * tenure_strength);
    (score.round() as i32).clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadgen_common::LeadGrade;

    #[test]
    fn failed_providers_dilute_confidence() {
        let full = PartialEnrichment {
            provider: "registry".into(),
            phone: Some("5125550100".into()),
            review_count: Some(20),
            rating: Some(4.5),
            years_in_business: Some(8),
            ..Default::default()
        };
        assert_eq!(enrichment_confidence(&[full.clone()], 1), 1.0);
        assert_eq!(enrichment_confidence(&[full], 2), 0.5);
        assert_eq!(enrichment_confidence(&[], 0), 0.0);
    }

    #[test]
    fn reference_lead_grades_b() {
        let policy = LeadPolicy::default();
        let score = lead_score(
            74,
            1.0,
            BusinessSignals {
                review_count: Some(20),
                rating: Some(4.5),
                years_in_business: Some(8),
            },
            &policy,
        );
        assert_eq!(score, 76);
        assert_eq!(policy.grade(score), LeadGrade::B);
    }

    #[test]
    fn score_is_bounded() {
        let policy = LeadPolicy::default();
        let max = lead_score(
            100,
            1.0,
            BusinessSignals {
                review_count: Some(10_000),
                rating: Some(5.0),
                years_in_business: Some(90),
            },
            &policy,
        );
        assert_eq!(max, 100);
        assert_eq!(lead_score(0, 0.0, BusinessSignals::default(), &policy), 0);
    }
}
