//! HTML-to-Markdown conversion, plain-text extraction and cleanup passes.
//!
//! Scraped pages are converted with `htmd` and cleaned so they can be fed to
//! an LLM; LLM output is sanitised before it is written to a document.

mod cleanup;

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use bookgen_shared::{BookGenError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A scraped page in the three shapes the pipeline uses.
#[derive(Debug, Clone, Default)]
pub struct PageContent {
    /// Cleaned Markdown of the main content.
    pub markdown: String,
    /// Plain text of the main content, one block per line.
    pub text: String,
    /// `<title>` or first H1, if any.
    pub title: Option<String>,
    /// Approximate word count of the Markdown.
    pub word_count: usize,
}

/// Tags whose content never counts as page text.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "iframe", "noscript", "svg", "header", "footer", "form", "button",
];

/// Tags that start a new line in plain-text output.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "blockquote", "section",
    "article", "pre", "dd", "dt",
];

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

/// Convert a fetched HTML page into Markdown and plain text.
///
/// 1. Picks the main content container (falls back to `<body>`)
/// 2. Pre-processes HTML tables into Markdown tables
/// 3. Converts HTML → Markdown via `htmd` and runs the cleanup passes
/// 4. Extracts plain text from the same container
#[instrument(skip(html), fields(url = %source_url))]
pub fn convert_page(html: &str, source_url: &str) -> Result<PageContent> {
    let doc = Html::parse_document(html);
    let content_html = extract_content_html(&doc).unwrap_or_else(|| html.to_string());
    let text = html_to_text(&content_html);

    let markdown = html_to_markdown(&content_html, source_url)?;
    let title = extract_title(&doc).or_else(|| extract_title_from_markdown(&markdown));
    let word_count = count_words(&markdown);

    debug!(
        word_count,
        text_len = text.len(),
        md_len = markdown.len(),
        "page converted"
    );

    Ok(PageContent {
        markdown,
        text,
        title,
        word_count,
    })
}

/// Convert an HTML fragment to cleaned Markdown.
pub fn html_to_markdown(content_html: &str, source_url: &str) -> Result<String> {
    let content_html = preprocess_tables(content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let raw_markdown = converter
        .convert(&content_html)
        .map_err(|e| BookGenError::Conversion(format!("htmd conversion failed: {e}")))?;

    let base_url = Url::parse(source_url).ok();
    Ok(cleanup::run_page_pipeline(&raw_markdown, base_url.as_ref()))
}

/// Plain text of an HTML fragment: script/chrome dropped, block elements on
/// their own lines, runs of spaces collapsed.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut raw = String::new();

    for node in fragment.root_element().descendants() {
        if let Some(element) = node.value().as_element() {
            if BLOCK_TAGS.contains(&element.name()) {
                raw.push('\n');
            }
            continue;
        }
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|e| SKIP_TAGS.contains(&e.name()))
        });
        if !hidden {
            raw.push_str(text);
        }
    }

    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Clean up LLM-written Markdown before it is stored: unwrap code fences,
/// drop a stray `markdown` tag line, normalise blank lines.
pub fn sanitize_llm_markdown(md: &str) -> String {
    cleanup::run_llm_pipeline(md)
}

// ---------------------------------------------------------------------------
// Table pre-processing
// ---------------------------------------------------------------------------

/// Convert HTML `<table>` elements to markdown table syntax before htmd conversion.
///
/// `htmd` 0.1 doesn't support table conversion, so we handle it manually.
fn preprocess_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let table_sel = Selector::parse("table").unwrap();

    if doc.select(&table_sel).next().is_none() {
        return html.to_string();
    }

    // Replace within the re-serialised fragment so the parser's implied
    // <tbody> elements appear on both sides of the match.
    let mut result = doc.root_element().inner_html();
    for table_el in doc.select(&table_sel) {
        let md_table = html_table_to_markdown(&table_el);
        result = result.replacen(&table_el.html(), &md_table, 1);
    }
    result
}

/// Convert a single HTML table element to a markdown table string.
fn html_table_to_markdown(table: &scraper::ElementRef) -> String {
    let tr_sel = Selector::parse("tr").unwrap();
    let cell_sel = Selector::parse("th, td").unwrap();

    let mut rows: Vec<Vec<String>> = table
        .select(&tr_sel)
        .map(|tr| {
            tr.select(&cell_sel)
                .map(|cell| {
                    cell.text()
                        .collect::<String>()
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();

    let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    if col_count == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(col_count, String::new());
    }

    let mut md = String::from("\n\n");
    for (i, row) in rows.iter().enumerate() {
        md.push_str(&format!("| {} |\n", row.join(" | ")));
        if i == 0 {
            md.push_str(&format!("| {} |\n", vec!["---"; col_count].join(" | ")));
        }
    }
    md.push('\n');
    md
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Inner HTML of the main content container, if the page has one.
fn extract_content_html(doc: &Html) -> Option<String> {
    // Known content containers in priority order
    let selectors = [
        "article .entry-content",
        ".post-content",
        ".entry-content",
        "[role=\"main\"]",
        "article",
        "main",
        "#content",
        ".content",
        "body",
    ];

    selectors.iter().find_map(|sel_str| {
        let selector = Selector::parse(sel_str).ok()?;
        doc.select(&selector).next().map(|el| el.inner_html())
    })
}

fn extract_title(doc: &Html) -> Option<String> {
    let selector = Selector::parse("title").unwrap();
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Extract title from the first H1 in the Markdown text.
fn extract_title_from_markdown(md: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));

    H1_RE.captures(md).map(|c| c[1].trim().to_string())
}

/// Count words in Markdown, ignoring fenced code and bare heading markers.
pub fn count_words(md: &str) -> usize {
    static CODE_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));

    let without_code = CODE_BLOCK_RE.replace_all(md, "");
    without_code
        .split_whitespace()
        .filter(|w| !w.chars().all(|c| c == '#' || c == '-' || c == '*' || c == '|'))
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const REVIEW_PAGE: &str = r#"<html>
        <head><title>Dune review | Books Weekly</title></head>
        <body>
            <nav><a href="/">Home</a><a href="/reviews">Reviews</a></nav>
            <article>
                <h1>Dune, fifty years on</h1>
                <p>Frank Herbert's <strong>Dune</strong> is a novel about ecology.</p>
                <p>See <a href="/authors/herbert">the author page</a>.</p>
                <script>trackPageView();</script>
                <table>
                    <tr><th>Year</th><th>Award</th></tr>
                    <tr><td>1966</td><td>Hugo</td></tr>
                </table>
            </article>
            <footer><p>Copyright Books Weekly</p></footer>
        </body></html>"#;

    #[test]
    fn convert_picks_main_content() {
        let page = convert_page(REVIEW_PAGE, "https://books.example.com/dune").unwrap();

        assert_eq!(page.title.as_deref(), Some("Dune review | Books Weekly"));
        assert!(page.markdown.contains("# Dune, fifty years on"));
        assert!(page.markdown.contains("**Dune**"));
        assert!(!page.markdown.contains("Copyright"));
        assert!(!page.markdown.contains("Reviews"));
        assert!(page.word_count > 10);
    }

    #[test]
    fn convert_resolves_links_and_tables() {
        let page = convert_page(REVIEW_PAGE, "https://books.example.com/dune").unwrap();

        assert!(
            page.markdown
                .contains("(https://books.example.com/authors/herbert)")
        );
        assert!(page.markdown.contains("| Year | Award |"));
        assert!(page.markdown.contains("| 1966 | Hugo |"));
    }

    #[test]
    fn text_skips_scripts_and_keeps_blocks() {
        let page = convert_page(REVIEW_PAGE, "https://books.example.com/dune").unwrap();

        assert!(!page.text.contains("trackPageView"));
        assert!(page.text.contains("Frank Herbert's Dune is a novel about ecology."));
        assert!(page.text.lines().any(|l| l == "Dune, fifty years on"));
    }

    #[test]
    fn page_without_container_uses_body() {
        let html = "<html><body><h1>Direct</h1><p>Body text.</p></body></html>";
        let page = convert_page(html, "https://example.com/").unwrap();
        assert!(page.markdown.contains("Body text."));
        assert_eq!(page.title.as_deref(), Some("Direct"));
    }

    #[test]
    fn empty_page_converts_to_nothing() {
        let page = convert_page("<html><body></body></html>", "https://example.com/").unwrap();
        assert_eq!(page.markdown.trim(), "");
        assert_eq!(page.text, "");
        assert_eq!(page.word_count, 0);
    }

    #[test]
    fn word_count_ignores_code_and_markers() {
        assert_eq!(count_words("## Heading here\n\n- one two\n\n```\nfn x() {}\n```"), 4);
    }

    #[test]
    fn sanitize_unwraps_fenced_answer() {
        assert_eq!(
            sanitize_llm_markdown("```markdown\nHello.\n```"),
            "Hello.\n"
        );
    }
}
