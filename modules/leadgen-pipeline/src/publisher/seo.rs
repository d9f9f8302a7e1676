//! Page metadata and the schema.org block for a published profile.

use leadgen_common::{EnrichedLead, LocalBusinessJsonLd, PostalAddress, SeoMetadata};

const TITLE_MAX: usize = 60;
const DESCRIPTION_MAX: usize = 155;

pub fn canonical_path(slug: &str) -> String {
    format!("/pros/{slug}")
}

fn place(lead: &EnrichedLead) -> Option<String> {
    match (lead.city.as_deref(), lead.state.as_deref()) {
        (Some(city), Some(state)) => Some(format!("{city}, {state}")),
        (Some(city), None) => Some(city.to_string()),
        (None, Some(state)) => Some(state.to_string()),
        (None, None) => None,
    }
}

/// Cut at a char boundary, ending on a whole word when one fits.
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    let trimmed = match cut.rfind(' ') {
        Some(i) if i > max / 2 => &cut[..i],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end_matches([' ', ',', '-', '|']))
}

pub fn build_seo(lead: &EnrichedLead, slug: &str) -> SeoMetadata {
    let category = lead.category.as_deref().unwrap_or("Local business");
    let place = place(lead);

    let title = match &place {
        Some(place) => format!("{} | {category} in {place}", lead.business_name),
        None => format!("{} | {category}", lead.business_name),
    };

    let mut description = match &place {
        Some(place) => format!(
            "{} is a {} serving {place}.",
            lead.business_name,
            category.to_lowercase()
        ),
        None => format!("{} is a local {}.", lead.business_name, category.to_lowercase()),
    };
    if let Some(rating) = lead.rating {
        if let Some(reviews) = lead.review_count.filter(|r| *r > 0) {
            description.push_str(&format!(" Rated {rating:.1} from {reviews} reviews."));
        }
    }
    if let Some(years) = lead.years_in_business.filter(|y| *y > 0) {
        description.push_str(&format!(" In business {years} years."));
    }
    description.push_str(" Request a quote today.");

    let mut keywords: Vec<String> = Vec::new();
    let mut push = |k: String| {
        let k = k.trim().to_lowercase();
        if !k.is_empty() && !keywords.contains(&k) {
            keywords.push(k);
        }
    };
    if let Some(category) = &lead.category {
        push(category.clone());
        if let Some(city) = &lead.city {
            push(format!("{category} {city}"));
        }
    }
    if let Some(city) = &lead.city {
        push(city.clone());
    }
    if let Some(zip) = &lead.zip_code {
        push(zip.clone());
    }
    push(lead.business_name.clone());

    SeoMetadata {
        meta_title: truncate(&title, TITLE_MAX),
        meta_description: truncate(&description, DESCRIPTION_MAX),
        canonical_path: canonical_path(slug),
        keywords,
    }
}

pub fn build_json_ld(lead: &EnrichedLead, public_base_url: &str, slug: &str) -> LocalBusinessJsonLd {
    let mut same_as: Vec<String> = Vec::new();
    same_as.extend(lead.website.clone());
    same_as.extend(lead.social.facebook.clone());
    same_as.extend(lead.social.instagram.clone());
    same_as.extend(lead.social.other.iter().cloned());

    LocalBusinessJsonLd {
        context: "https://schema.org".to_string(),
        kind: "LocalBusiness".to_string(),
        name: lead.business_name.clone(),
        url: format!(
            "{}{}",
            public_base_url.trim_end_matches('/'),
            canonical_path(slug)
        ),
        telephone: lead.phone.clone(),
        address: PostalAddress {
            kind: "PostalAddress".to_string(),
            street_address: lead.address_line.clone(),
            address_locality: lead.city.clone(),
            address_region: lead.state.clone(),
            postal_code: lead.zip_code.clone(),
        },
        same_as,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_limit_and_words() {
        let long = "Joe's Plumbing and Emergency Drain Cleaning | Plumber in San Antonio, TX";
        let t = truncate(long, TITLE_MAX);
        assert!(t.chars().count() <= TITLE_MAX, "{t}");
        assert!(t.ends_with('…'));
        assert_eq!(truncate("short", TITLE_MAX), "short");
    }

    #[test]
    fn truncate_handles_multibyte_text() {
        let text = "Fontanería ".repeat(20);
        let t = truncate(&text, 30);
        assert!(t.chars().count() <= 30);
    }
}
