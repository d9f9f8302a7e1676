/// Lowercase ASCII words joined by single hyphens. Apostrophes vanish
/// ("Joe's" → "joes") and common Latin accents fold to their base letter.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_hyphen = false;
    for c in input.chars() {
        if matches!(c, '\'' | '’' | '`') {
            continue;
        }
        let folded = fold(c.to_lowercase().next().unwrap_or(c));
        if folded.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(folded);
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

fn fold(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    }
}

/// Longest numeric suffix considered part of a numbered slug.
const MAX_COUNTER_DIGITS: usize = 18;

/// Where a lead's slug comes from: the fixed candidates `base` then
/// `base-city`, and after those `stem-2`, `stem-3`, ... where `stem` is
/// `base-city` (or `base` when the city is unknown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugPlan {
    pub fixed: Vec<String>,
    pub stem: String,
}

impl SlugPlan {
    pub fn numbered(&self, n: u64) -> String {
        format!("{}-{n}", self.stem)
    }
}

pub fn plan(business_name: &str, city: Option<&str>) -> SlugPlan {
    let mut base = slugify(business_name);
    if base.is_empty() {
        base = "business".to_string();
    }
    match city.map(slugify).filter(|c| !c.is_empty()) {
        Some(city) => {
            let stem = format!("{base}-{city}");
            SlugPlan {
                fixed: vec![base, stem.clone()],
                stem,
            }
        }
        None => SlugPlan {
            fixed: vec![base.clone()],
            stem: base,
        },
    }
}

/// `n` when `slug` is `{stem}-{n}` with `n` a positive decimal counter.
pub fn counter_of(slug: &str, stem: &str) -> Option<u64> {
    let digits = slug.strip_prefix(stem)?.strip_prefix('-')?;
    if digits.is_empty()
        || digits.len() > MAX_COUNTER_DIGITS
        || digits.starts_with('0')
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok()
}
