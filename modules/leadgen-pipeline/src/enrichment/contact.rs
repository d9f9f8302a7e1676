//! Contact field normalization. Anything that fails a shape check is dropped
//! rather than stored half-valid.

use std::sync::LazyLock;

use regex::Regex;

use leadgen_common::SocialLinks;

use crate::icp::host_of;

static RE_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s.]{2,}$").unwrap());

static RE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*\.[a-z]{2,}(:\d+)?([/?#]\S*)?$")
        .unwrap()
});

/// Digits only, 7 to 15 of them (E.164 upper bound).
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (7..=15).contains(&digits.len()).then_some(digits)
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    RE_EMAIL.is_match(&email).then_some(email)
}

/// Adds `https://` when the scheme is missing.
pub fn normalize_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let url = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    RE_URL.is_match(&url).then_some(url)
}

/// Sort links into Facebook, Instagram and everything else, dropping malformed
/// and duplicate ones.
pub fn classify_social<'a>(links: impl IntoIterator<Item = &'a String>) -> SocialLinks {
    let mut social = SocialLinks::default();
    for link in links {
        let Some(url) = normalize_url(link) else {
            continue;
        };
        let host = host_of(&url);
        if host == "facebook.com" || host == "fb.com" || host.ends_with(".facebook.com") {
            social.facebook.get_or_insert(url);
        } else if host == "instagram.com" || host == "instagr.am" {
            social.instagram.get_or_insert(url);
        } else if !social.other.contains(&url) {
            social.other.push(url);
        }
    }
    social
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_keeps_digits_within_bounds() {
        assert_eq!(normalize_phone("(512) 555-0100").as_deref(), Some("5125550100"));
        assert_eq!(normalize_phone("+52 55 1234 5678").as_deref(), Some("525512345678"));
        assert_eq!(normalize_phone("555-01"), None);
        assert_eq!(normalize_phone("1234567890123456"), None);
    }

    #[test]
    fn email_and_url_shapes() {
        assert_eq!(normalize_email(" Joe@Example.com ").as_deref(), Some("joe@example.com"));
        assert_eq!(normalize_email("joe@localhost"), None);
        assert_eq!(
            normalize_url("joesplumbing.example").as_deref(),
            Some("https://joesplumbing.example")
        );
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn social_links_sorted_by_host() {
        let links = vec![
            "https://www.facebook.com/joes".to_string(),
            "instagram.com/joes".to_string(),
            "https://nextdoor.com/pages/joes".to_string(),
            "https://nextdoor.com/pages/joes".to_string(),
        ];
        let social = classify_social(&links);
        assert_eq!(social.facebook.as_deref(), Some("https://www.facebook.com/joes"));
        assert_eq!(social.instagram.as_deref(), Some("https://instagram.com/joes"));
        assert_eq!(social.other, vec!["https://nextdoor.com/pages/joes".to_string()]);
    }
}
