//! Core domain types for bookgen projects.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One row of a row-store tab: column name to cell value.
pub type Row = serde_json::Map<String, Value>;

/// Display text of a cell: strings unquoted, missing/null empty.
pub fn cell_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ProjectId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for project identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    /// Generate a new time-sortable project identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Identity helpers
// ---------------------------------------------------------------------------

/// Maximum length of a single slug component.
const MAX_SLUG_LEN: usize = 96;

/// Hex digits of the SHA-256 suffix on hashed slugs.
const SLUG_HASH_LEN: usize = 12;

/// Deterministic, filesystem- and key-safe form of any string.
///
/// Lowercase ASCII alphanumerics survive; every other run of characters
/// becomes a single `-`. A slug longer than 96 characters is cut and gets a
/// hash of the raw input appended, so long inputs sharing a prefix stay
/// distinct.
pub fn slugify(input: &str) -> String {
    let slug = plain_slug(input);
    if slug.len() > MAX_SLUG_LEN {
        with_hash(slug, input)
    } else {
        slug
    }
}

/// Like [`slugify`], but always carries the input hash. Used where
/// punctuation matters for identity (`/a?b=1` and `/a/b/1` are different
/// URLs).
pub fn hashed_slug(input: &str) -> String {
    with_hash(plain_slug(input), input)
}

fn plain_slug(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn with_hash(mut slug: String, input: &str) -> String {
    slug.truncate(MAX_SLUG_LEN - SLUG_HASH_LEN - 1);
    while slug.ends_with('-') {
        slug.pop();
    }
    let digest = format!("{:x}", Sha256::digest(input.as_bytes()));
    if !slug.is_empty() {
        slug.push('-');
    }
    slug.push_str(&digest[..SLUG_HASH_LEN]);
    slug
}

/// Checkpoint key for a Source, stable for a given title and URL.
pub fn source_key(title: &str, url: &str) -> String {
    format!("source/{}_{}", slugify(title), hashed_slug(url))
}

/// Checkpoint key for a Topic, stable for a given title, order and name.
pub fn topic_key(title: &str, order: f64, name: &str) -> String {
    format!("topic/{}-{}-{}", slugify(title), format_order(order), slugify(name))
}

/// Checkpoint key for a marketplace product page.
pub fn product_key(title: &str, url: &str) -> String {
    format!("product/{}_{}", slugify(title), hashed_slug(url))
}

/// Checkpoint key for a per-project artifact (facts, meta, audiobook section).
pub fn project_key(title: &str, artifact: &str) -> String {
    format!("project/{}/{}", slugify(title), artifact)
}

/// `3` for whole orders, `1.5` otherwise.
pub fn format_order(order: f64) -> String {
    if order.fract() == 0.0 {
        format!("{}", order as i64)
    } else {
        format!("{order}")
    }
}

// ---------------------------------------------------------------------------
// Completion checks
// ---------------------------------------------------------------------------

/// Whether generated text is real content rather than an empty slot or a
/// placeholder.
///
/// Code fences and whitespace do not count toward the threshold.
pub fn is_substantive(text: &str, min_chars: usize) -> bool {
    let meaningful = text
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .count();
    meaningful >= min_chars.max(1)
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Progress of a fetched-and-analysed item (Source, ProductPage).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Pending,
    Fetched,
    Analyzed,
    Failed,
}

/// Progress of an article topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    #[default]
    Pending,
    Drafted,
    Refined,
    Failed,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Kind of a section in the assembled article.
///
/// Injected sections own fixed bands between 0 and 2 so they interleave
/// with LLM-authored topics (which start at 1) the same way every run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "order", rename_all = "snake_case")]
pub enum SectionKind {
    Meta,
    KeyFacts,
    InterestingFacts,
    OnAudiobook,
    Topic(f64),
}

impl SectionKind {
    /// Sort key of this section.
    pub fn order(&self) -> f64 {
        match self {
            Self::Meta => 0.1,
            Self::KeyFacts => 0.5,
            Self::InterestingFacts => 1.5,
            Self::OnAudiobook => 1.6,
            Self::Topic(order) => *order,
        }
    }
}

/// One named block of the final article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub name: String,
    pub text: String,
}

impl Section {
    pub fn order(&self) -> f64 {
        self.kind.order()
    }
}

/// Stable ascending sort by section order.
pub fn sort_sections(sections: &mut [Section]) {
    sections.sort_by(|a, b| a.order().total_cmp(&b.order()));
}

// ---------------------------------------------------------------------------
// Source records
// ---------------------------------------------------------------------------

/// Reduced view of one analysed Source, as written to `Source Information`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub url: String,
    #[serde(default)]
    pub content_name: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub coverage_rating: f64,
    #[serde(default)]
    pub analysis_notes: String,
}

/// Sort by coverage rating (descending, stable), drop anything below
/// `min_rating`, keep at most `max_count`.
pub fn filter_sources(
    mut summaries: Vec<SourceSummary>,
    min_rating: f64,
    max_count: usize,
) -> Vec<SourceSummary> {
    summaries.sort_by(|a, b| b.coverage_rating.total_cmp(&a.coverage_rating));
    summaries.retain(|s| s.coverage_rating >= min_rating);
    summaries.truncate(max_count);
    summaries
}

// ---------------------------------------------------------------------------
// Topic records
// ---------------------------------------------------------------------------

/// One planned article section as produced by topic synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicRecord {
    #[serde(deserialize_with = "lenient_f64")]
    pub order: f64,
    #[serde(alias = "topic_name")]
    pub name: String,
    #[serde(default, alias = "topic_notes")]
    pub notes: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub word_count: u32,
    #[serde(default, deserialize_with = "lenient_url_list")]
    pub sources: Vec<String>,
}

// ---------------------------------------------------------------------------
// Marketplace listings
// ---------------------------------------------------------------------------

/// Structured data extracted from one marketplace product page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingInfo {
    pub asin: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub narrators: Vec<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub abridged: bool,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub num_ratings: u64,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub reviews: Vec<String>,
}

impl ListingInfo {
    /// Two listings with the same key are the same edition.
    pub fn dedup_key(&self) -> (String, String, String, bool) {
        (
            self.title.trim().to_lowercase(),
            self.authors.join(", ").to_lowercase(),
            self.narrators.join(", ").to_lowercase(),
            self.abridged,
        )
    }

    /// Duration as `HH:MM`, if known.
    pub fn say_duration(&self) -> Option<String> {
        self.duration_minutes
            .map(|m| format!("{:02}:{:02}", m / 60, m % 60))
    }
}

// ---------------------------------------------------------------------------
// Lenient deserializers for LLM- and human-edited values
// ---------------------------------------------------------------------------

/// Best-effort number from a JSON value: numbers pass through, strings are
/// trimmed and parsed (`"8/10"` reads as 8), everything else is 0.
pub fn value_to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => {
            let head = s.trim().split('/').next().unwrap_or("").trim();
            head.parse().unwrap_or(0.0)
        }
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(value_to_f64(&value))
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u32, D::Error> {
    let value = Value::deserialize(d)?;
    let n = value_to_f64(&value);
    if n.is_sign_negative() {
        return Err(de::Error::custom(format!("negative count: {n}")));
    }
    Ok(n.round() as u32)
}

/// Accepts `["u1", "u2"]`, `[{"url": "u1"}]` or `"u1, u2"`.
fn lenient_url_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    let value = Value::deserialize(d)?;
    let urls = match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Object(map) => map.get("url").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        Value::String(s) => s.split([',', '\n']).map(str::to_string).collect(),
        _ => Vec::new(),
    };
    Ok(urls
        .into_iter()
        .map(|u: String| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_id_roundtrip() {
        let id = ProjectId::new();
        let parsed: ProjectId = id.to_string().parse().expect("parse ProjectId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("The Hobbit: There & Back"), "the-hobbit-there-back");
        assert_eq!(
            slugify("https://example.com/a?b=1"),
            "https-example-com-a-b-1"
        );
        assert_eq!(slugify("  --  "), "");
    }

    #[test]
    fn long_inputs_with_a_shared_prefix_keep_distinct_keys() {
        let prefix = format!("https://www.reddit.com/r/printSF/comments/{}", "x".repeat(100));
        let first = format!("{prefix}/?page=1");
        let second = format!("{prefix}/?page=2");
        assert_ne!(source_key("Dune", &first), source_key("Dune", &second));
        assert_ne!(product_key("Dune", &first), product_key("Dune", &second));

        let name = "a very long topic name ".repeat(6);
        assert_ne!(slugify(&format!("{name} Draft")), slugify(&format!("{name} Refined")));
        assert!(slugify(&format!("{name} Draft")).len() <= 96);
    }

    #[test]
    fn url_keys_keep_punctuation_apart() {
        assert_ne!(
            source_key("Dune", "https://a.org/a?b=1"),
            source_key("Dune", "https://a.org/a/b/1")
        );
        assert_eq!(hashed_slug("https://a.org/x"), hashed_slug("https://a.org/x"));
        assert!(hashed_slug("https://a.org/x").starts_with("https-a-org-x-"));
    }

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(
            topic_key("Dune", 2.0, "The Spice"),
            "topic/dune-2-the-spice"
        );
        assert_eq!(topic_key("Dune", 1.5, "x"), "topic/dune-1.5-x");
        assert_eq!(
            source_key("Dune", "https://a.org/x"),
            source_key("Dune", "https://a.org/x")
        );
    }

    #[test]
    fn placeholders_are_not_substantive() {
        assert!(!is_substantive("", 10));
        assert!(!is_substantive("TBD", 10));
        assert!(!is_substantive("```markdown\n\n```", 10));
        assert!(!is_substantive("a b c d e", 10));
        assert!(is_substantive("A real paragraph of text.", 10));
    }

    #[test]
    fn injected_sections_keep_their_bands() {
        let mut sections = vec![
            Section { kind: SectionKind::Topic(2.0), name: "b".into(), text: String::new() },
            Section { kind: SectionKind::OnAudiobook, name: "audio".into(), text: String::new() },
            Section { kind: SectionKind::Topic(1.0), name: "a".into(), text: String::new() },
            Section { kind: SectionKind::InterestingFacts, name: "if".into(), text: String::new() },
            Section { kind: SectionKind::KeyFacts, name: "kf".into(), text: String::new() },
            Section { kind: SectionKind::Meta, name: "meta".into(), text: String::new() },
        ];
        sort_sections(&mut sections);
        let names: Vec<_> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["meta", "kf", "a", "if", "audio", "b"]);
    }

    #[test]
    fn coverage_filter_sorts_and_cuts() {
        let summaries = [9.0, 6.0, 8.0]
            .iter()
            .enumerate()
            .map(|(i, r)| SourceSummary {
                url: format!("https://s{i}.example"),
                content_name: String::new(),
                coverage_rating: *r,
                analysis_notes: String::new(),
            })
            .collect();
        let kept = filter_sources(summaries, 7.0, 80);
        let ratings: Vec<f64> = kept.iter().map(|s| s.coverage_rating).collect();
        assert_eq!(ratings, vec![9.0, 8.0]);
        assert_eq!(kept[0].url, "https://s0.example");
    }

    #[test]
    fn coverage_filter_ties_keep_input_order() {
        let summaries = ["a", "b", "c"]
            .iter()
            .map(|u| SourceSummary {
                url: u.to_string(),
                content_name: String::new(),
                coverage_rating: 8.0,
                analysis_notes: String::new(),
            })
            .collect();
        let kept = filter_sources(summaries, 7.0, 2);
        let urls: Vec<_> = kept.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b"]);
    }

    #[test]
    fn topic_record_accepts_loose_shapes() {
        let record: TopicRecord = serde_json::from_value(json!({
            "order": "3",
            "topic_name": "Themes",
            "topic_notes": "power, ecology",
            "word_count": 350.0,
            "sources": [{"url": "https://a.org"}, "https://b.org"]
        }))
        .expect("parse record");
        assert_eq!(record.order, 3.0);
        assert_eq!(record.name, "Themes");
        assert_eq!(record.word_count, 350);
        assert_eq!(record.sources, vec!["https://a.org", "https://b.org"]);

        let record: TopicRecord = serde_json::from_value(json!({
            "order": 1,
            "name": "Intro",
            "sources": "https://a.org, https://b.org"
        }))
        .expect("parse record");
        assert_eq!(record.sources.len(), 2);
    }

    #[test]
    fn lenient_numbers() {
        assert_eq!(value_to_f64(&json!("8/10")), 8.0);
        assert_eq!(value_to_f64(&json!(" 7 ")), 7.0);
        assert_eq!(value_to_f64(&json!(null)), 0.0);
        assert_eq!(value_to_f64(&json!("n/a")), 0.0);
    }

    #[test]
    fn listing_duration_formatting() {
        let listing = ListingInfo {
            duration_minutes: Some(605),
            ..Default::default()
        };
        assert_eq!(listing.say_duration().as_deref(), Some("10:05"));
    }
}
