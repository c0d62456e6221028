//! Cleanup passes for Markdown text.
//!
//! Each pass is a function `&str -> String` applied in sequence. Scraped
//! pages and LLM output go through different pipelines.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Cleanup for Markdown converted from a scraped page.
pub(crate) fn run_page_pipeline(md: &str, base_url: Option<&Url>) -> String {
    let mut result = strip_images(md);

    result = normalize_headings(&result);
    result = strip_leftover_html(&result);
    result = resolve_links(&result, base_url);
    result = normalize_whitespace(&result);
    result = clean_blank_lines(&result);
    result = ensure_trailing_newline(&result);

    result
}

/// Cleanup for Markdown written by an LLM before it lands in a document.
pub(crate) fn run_llm_pipeline(md: &str) -> String {
    let mut result = strip_code_fences(md);

    result = strip_language_tag_line(&result);
    result = normalize_whitespace(&result);
    result = clean_blank_lines(&result);
    result = ensure_trailing_newline(result.trim_start_matches('\n'));

    result
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Drop inline images; only their alt text would reach the model anyway.
fn strip_images(md: &str) -> String {
    static IMG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid regex"));

    IMG_RE.replace_all(md, "").to_string()
}

// ---------------------------------------------------------------------------
// Headings
// ---------------------------------------------------------------------------

/// Keep at most one H1; later ones become H2.
fn normalize_headings(md: &str) -> String {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^#\s+(.+)$").expect("valid regex"));

    let mut seen_h1 = false;
    md.lines()
        .map(|line| match H1_RE.captures(line) {
            Some(caps) if seen_h1 => format!("## {}", &caps[1]),
            Some(_) => {
                seen_h1 = true;
                line.to_string()
            }
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Blank lines
// ---------------------------------------------------------------------------

/// Collapse runs of blank lines into a single blank line.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}

// ---------------------------------------------------------------------------
// Leftover HTML
// ---------------------------------------------------------------------------

/// Remove layout tags that survived the conversion, keeping their text.
/// Code blocks are left untouched.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|font|center)(?:\s[^>]*)?>").expect("valid regex")
    });

    let mut in_code_block = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_code_block = !in_code_block;
                return line.to_string();
            }
            if in_code_block {
                line.to_string()
            } else {
                HTML_TAG_RE.replace_all(line, "").to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Resolve relative URLs in Markdown links against the page URL.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    let Some(base) = base_url else {
        return md.to_string();
    };

    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    LINK_RE
        .replace_all(md, |caps: &regex::Captures| {
            let text = &caps[1];
            let href = &caps[2];

            if href.starts_with("http://")
                || href.starts_with("https://")
                || href.starts_with('#')
                || href.starts_with("mailto:")
            {
                return caps[0].to_string();
            }

            match base.join(href) {
                Ok(resolved) => format!("[{text}]({resolved})"),
                Err(_) => caps[0].to_string(),
            }
        })
        .to_string()
}

// ---------------------------------------------------------------------------
// LLM output
// ---------------------------------------------------------------------------

/// Remove code fence lines, keeping what was inside them. Models often wrap
/// a whole Markdown answer in a fence.
fn strip_code_fences(md: &str) -> String {
    md.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop a leading line that only says `markdown` (a fence tag split from
/// its backticks).
fn strip_language_tag_line(md: &str) -> String {
    let trimmed = md.trim_start();
    match trimmed.split_once('\n') {
        Some((first, rest)) if first.trim().eq_ignore_ascii_case("markdown") => rest.to_string(),
        None if trimmed.trim().eq_ignore_ascii_case("markdown") => String::new(),
        _ => md.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Whitespace
// ---------------------------------------------------------------------------

/// Trim trailing whitespace on every line.
fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ensure the text ends with exactly one newline.
fn ensure_trailing_newline(md: &str) -> String {
    let trimmed = md.trim_end_matches('\n');
    format!("{trimmed}\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_are_removed() {
        let input = "Intro ![cover](https://img.example/c.jpg) text";
        assert_eq!(strip_images(input), "Intro  text");
    }

    #[test]
    fn normalize_headings_demotes_duplicate_h1() {
        let input = "# Title\n\nSome text\n\n# Another Title\n\nMore text";
        assert_eq!(
            normalize_headings(input),
            "# Title\n\nSome text\n\n## Another Title\n\nMore text"
        );
    }

    #[test]
    fn blank_line_runs_collapse() {
        assert_eq!(clean_blank_lines("Line 1\n\n\n\n\nLine 2"), "Line 1\n\nLine 2");
        assert_eq!(clean_blank_lines("Line 1\n\nLine 2"), "Line 1\n\nLine 2");
    }

    #[test]
    fn leftover_html_outside_code_is_stripped() {
        let input = "<div class=\"note\">Important</div>\n```html\n<div>Kept</div>\n```";
        let result = strip_leftover_html(input);
        assert!(result.starts_with("Important\n"));
        assert!(result.contains("<div>Kept</div>"));
    }

    #[test]
    fn relative_links_resolve_against_page() {
        let base = Url::parse("https://books.example.com/reviews/dune").unwrap();
        assert_eq!(
            resolve_links("[Author](/authors/herbert)", Some(&base)),
            "[Author](https://books.example.com/authors/herbert)"
        );
        assert_eq!(
            resolve_links("[Elsewhere](https://other.org/x)", Some(&base)),
            "[Elsewhere](https://other.org/x)"
        );
        assert_eq!(resolve_links("[Top](#top)", Some(&base)), "[Top](#top)");
    }

    #[test]
    fn fenced_llm_answer_is_unwrapped() {
        let input = "```markdown\n## Themes\n\nPower and ecology.\n```\n";
        assert_eq!(run_llm_pipeline(input), "## Themes\n\nPower and ecology.\n");
    }

    #[test]
    fn split_language_tag_is_dropped() {
        let input = "markdown\n## Themes\nText";
        assert_eq!(run_llm_pipeline(input), "## Themes\nText\n");
    }

    #[test]
    fn the_word_markdown_survives_in_prose() {
        let input = "The author wrote in markdown once.";
        assert_eq!(run_llm_pipeline(input), "The author wrote in markdown once.\n");
    }

    #[test]
    fn page_pipeline_end_to_end() {
        let input = "# Title\n\n\n\n![x](y.png)\n<span>Body</span>   \n\n# Again\n";
        let base = Url::parse("https://example.com/page").unwrap();
        let result = run_page_pipeline(input, Some(&base));
        assert_eq!(result, "# Title\n\nBody\n\n## Again\n");
    }
}
