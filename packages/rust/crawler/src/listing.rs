//! Audiobook marketplace product pages.
//!
//! Structured fields come from the page's ld+json blocks; title, summary and
//! reviews come from the rendered HTML.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::debug;
use url::Url;

use bookgen_shared::{BookGenError, ListingInfo, Result};

/// Query parameters that stop the marketplace from redirecting to the
/// visitor's local storefront.
const COUNTRY_OVERRIDE: [(&str, &str); 2] =
    [("overrideBaseCountry", "true"), ("ipRedirectOverride", "true")];

/// ld+json `@type`s that describe an audiobook, in preference order.
const AUDIOBOOK_TYPES: [&str; 3] = ["PodcastSeries", "Audiobook", "BookSeries"];

/// Reviews by this placeholder name carry no signal.
const ANONYMOUS_REVIEWER: &str = "Amazon Customer";

/// The 10-character ASIN path segment of a product URL.
pub fn parse_asin(url: &str) -> Option<String> {
    static ASIN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"/([A-Z0-9]{10})(?:[/?]|$)").expect("valid regex"));

    ASIN_RE.captures(url).map(|c| c[1].to_string())
}

/// `url` with the country-override parameters appended.
pub fn with_country_override(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url).map_err(|e| BookGenError::parse(format!("{url}: {e}")))?;
    parsed.query_pairs_mut().extend_pairs(COUNTRY_OVERRIDE);
    Ok(parsed.into())
}

/// `url` without its query string and fragment.
pub fn strip_query(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.into()
        }
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    }
}

/// Extract listing details from a product page.
///
/// Fails only when the URL carries no ASIN; a page without structured data
/// yields a listing with empty fields.
pub fn parse_listing(html: &str, url: &str) -> Result<ListingInfo> {
    let asin = parse_asin(url)
        .ok_or_else(|| BookGenError::validation(format!("no ASIN in product URL {url}")))?;
    let doc = Html::parse_document(html);
    let data = audiobook_ld_json(&doc);

    let mut listing = ListingInfo {
        asin,
        url: strip_query(url),
        title: first_text(&doc, "h1").unwrap_or_default(),
        summary: summary(&doc).unwrap_or_default(),
        reviews: reviews(&doc),
        ..Default::default()
    };

    let Some(data) = data else {
        debug!(url, "product page has no audiobook ld+json");
        return Ok(listing);
    };

    if listing.title.is_empty() {
        listing.title = string_field(&data, "name").unwrap_or_default();
    }
    listing.authors = names(data.get("author"));
    listing.narrators = names(data.get("readBy"));
    listing.language = string_field(&data, "inLanguage").unwrap_or_default();
    listing.abridged = match data.get("abridged") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    };
    listing.duration_minutes = string_field(&data, "duration").map(|d| parse_duration_minutes(&d));
    listing.image_url = image(data.get("image"));

    if let Some(rating) = data.get("aggregateRating") {
        listing.num_ratings = rating.get("ratingCount").map(as_u64).unwrap_or(0);
        if listing.num_ratings > 0 {
            listing.rating = rating
                .get("ratingValue")
                .map(bookgen_shared::value_to_f64)
                .filter(|r| *r > 0.0);
        }
    }

    Ok(listing)
}

/// `PT10H5M` → 605. Only hours and minutes count.
pub fn parse_duration_minutes(duration: &str) -> u32 {
    static HOURS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+)H").expect("valid regex"));
    static MINUTES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+)M").expect("valid regex"));

    let capture = |re: &Regex| {
        re.captures(duration)
            .and_then(|c| c[1].parse::<u32>().ok())
            .unwrap_or(0)
    };
    capture(&HOURS_RE) * 60 + capture(&MINUTES_RE)
}

// ---------------------------------------------------------------------------
// ld+json
// ---------------------------------------------------------------------------

/// Every JSON object embedded in the page, with nested arrays flattened.
fn ld_json_objects(doc: &Html) -> Vec<Value> {
    let selector = Selector::parse(
        r#"script[type="application/ld+json"], script[type="application/json"]"#,
    )
    .unwrap();

    let mut out = Vec::new();
    for script in doc.select(&selector) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => flatten_into(value, &mut out),
            Err(e) => debug!(error = %e, "skipping unparsable json script"),
        }
    }
    out
}

fn flatten_into(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.into_iter().for_each(|item| flatten_into(item, out)),
        other => out.push(other),
    }
}

fn audiobook_ld_json(doc: &Html) -> Option<Value> {
    let objects = ld_json_objects(doc);
    AUDIOBOOK_TYPES.iter().find_map(|wanted| {
        objects
            .iter()
            .find(|o| o.get("@type").and_then(Value::as_str) == Some(*wanted))
            .cloned()
    })
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(|s| decode_entities(s.trim()))
        .filter(|s| !s.is_empty())
}

/// `[{"name": "A"}, {"name": "B"}]`, `{"name": "A"}` or `"A"`.
fn names(value: Option<&Value>) -> Vec<String> {
    let one = |v: &Value| match v {
        Value::String(s) => Some(decode_entities(s.trim())),
        Value::Object(_) => v
            .get("name")
            .and_then(Value::as_str)
            .map(|s| decode_entities(s.trim())),
        _ => None,
    };
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(one).collect(),
        Some(other) => one(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn image(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        Value::Object(map) => map.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn as_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.replace([',', '.'], "").trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// The handful of entities the marketplace double-encodes inside JSON.
fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

// ---------------------------------------------------------------------------
// HTML fields
// ---------------------------------------------------------------------------

fn element_text(el: &ElementRef) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector)
        .next()
        .map(|el| element_text(&el))
        .filter(|t| !t.is_empty())
}

fn summary(doc: &Html) -> Option<String> {
    first_text(doc, r#"adbl-text-block[slot="summary"]"#)
        .or_else(|| first_text(doc, ".productPublisherSummary"))
}

/// Review cards: heading plus body paragraphs, anonymous reviewers skipped.
fn reviews(doc: &Html) -> Vec<String> {
    let card_sel = Selector::parse(".bc-tab-content .bc-section > .bc-row-responsive").unwrap();
    let heading_sel = Selector::parse("h3").unwrap();
    let reviewer_sel = Selector::parse("a.bc-link").unwrap();
    let paragraph_sel = Selector::parse("p").unwrap();

    doc.select(&card_sel)
        .filter_map(|card| {
            let heading = card.select(&heading_sel).next().map(|h| element_text(&h))?;
            let reviewer = card.select(&reviewer_sel).next().map(|a| element_text(&a))?;
            if reviewer.contains(ANONYMOUS_REVIEWER) {
                return None;
            }
            let body = card
                .select(&paragraph_sel)
                .map(|p| element_text(&p))
                .filter(|p| !p.is_empty() && !p.contains("found this helpful"))
                .collect::<Vec<_>>()
                .join(" ");
            Some(format!("{heading}: {body}").trim_end_matches([' ', ':']).to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT_PAGE: &str = r#"<html><head>
        <script type="application/ld+json">
        [{"@type": "BreadcrumbList"},
         {"@type": "Audiobook",
          "name": "Dune (JSON)",
          "author": [{"name": "Frank Herbert"}],
          "readBy": [{"name": "Scott Brick"}, {"name": "Orlagh Cassidy"}],
          "inLanguage": "english",
          "abridged": "false",
          "duration": "PT21H2M",
          "image": "https://m.media.example/dune.jpg",
          "aggregateRating": {"ratingValue": "4.6", "ratingCount": "1,234"}}]
        </script>
        </head><body>
        <h1>Dune</h1>
        <adbl-text-block slot="summary">Set on the desert planet   Arrakis.</adbl-text-block>
        <div class="bc-tab-content"><div class="bc-section">
            <div class="bc-row-responsive">
                <a class="bc-link bc-color-link">Jane</a>
                <h3>Masterpiece</h3>
                <p>Brick is superb.</p>
                <p class="bc-size-footnote">12 people found this helpful</p>
            </div>
            <div class="bc-row-responsive">
                <a class="bc-link bc-color-link">Amazon Customer</a>
                <h3>Meh</h3><p>Too long.</p>
            </div>
        </div></div>
        </body></html>"#;

    #[test]
    fn asin_from_urls() {
        assert_eq!(
            parse_asin("https://www.audible.com/pd/Dune-Audiobook/B002V1OF70?ref=x").as_deref(),
            Some("B002V1OF70")
        );
        assert_eq!(
            parse_asin("https://www.audible.com/pd/B002V1OF70").as_deref(),
            Some("B002V1OF70")
        );
        assert_eq!(parse_asin("https://www.audible.com/pd/short"), None);
    }

    #[test]
    fn country_override_appends_params() {
        assert_eq!(
            with_country_override("https://www.audible.com/pd/B002V1OF70").unwrap(),
            "https://www.audible.com/pd/B002V1OF70?overrideBaseCountry=true&ipRedirectOverride=true"
        );
        assert_eq!(
            with_country_override("https://www.audible.com/pd/B002V1OF70?a=1").unwrap(),
            "https://www.audible.com/pd/B002V1OF70?a=1&overrideBaseCountry=true&ipRedirectOverride=true"
        );
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration_minutes("PT21H2M"), 1262);
        assert_eq!(parse_duration_minutes("PT45M"), 45);
        assert_eq!(parse_duration_minutes(""), 0);
    }

    #[test]
    fn listing_fields_from_page() {
        let listing = parse_listing(
            PRODUCT_PAGE,
            "https://www.audible.com/pd/Dune-Audiobook/B002V1OF70?qid=1",
        )
        .unwrap();

        assert_eq!(listing.asin, "B002V1OF70");
        assert_eq!(listing.url, "https://www.audible.com/pd/Dune-Audiobook/B002V1OF70");
        assert_eq!(listing.title, "Dune");
        assert_eq!(listing.authors, vec!["Frank Herbert"]);
        assert_eq!(listing.narrators, vec!["Scott Brick", "Orlagh Cassidy"]);
        assert_eq!(listing.language, "english");
        assert!(!listing.abridged);
        assert_eq!(listing.duration_minutes, Some(1262));
        assert_eq!(listing.num_ratings, 1234);
        assert_eq!(listing.rating, Some(4.6));
        assert_eq!(
            listing.image_url.as_deref(),
            Some("https://m.media.example/dune.jpg")
        );
        assert_eq!(listing.summary, "Set on the desert planet Arrakis.");
        assert_eq!(listing.reviews, vec!["Masterpiece: Brick is superb."]);
    }

    #[test]
    fn page_without_structured_data() {
        let listing = parse_listing(
            "<html><body><h1>Something</h1></body></html>",
            "https://www.audible.com/pd/B000000001",
        )
        .unwrap();
        assert_eq!(listing.title, "Something");
        assert!(listing.authors.is_empty());
        assert_eq!(listing.num_ratings, 0);
        assert_eq!(listing.rating, None);
    }

    #[test]
    fn url_without_asin_is_rejected() {
        assert!(parse_listing("<html></html>", "https://www.audible.com/search").is_err());
    }
}
