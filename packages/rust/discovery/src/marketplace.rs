//! Audiobook marketplace search pages.

use std::collections::HashSet;

use scraper::{Html, Selector};
use url::Url;

use bookgen_shared::{BookGenError, Result, slugify};

/// Search page URL for a book on the marketplace.
pub fn search_url(base_url: &str, title: &str, author: &str, page_size: u32) -> Result<String> {
    let terms = slugify(&format!("{title} {author}")).replace('-', " ");
    let mut url = Url::parse(base_url)
        .and_then(|base| base.join("/search"))
        .map_err(|e| BookGenError::config(format!("invalid marketplace URL {base_url}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("keywords", &terms)
        .append_pair("k", &terms)
        .append_pair("pageSize", &page_size.to_string());
    Ok(url.into())
}

/// Product page links in a search result page, made absolute, with query
/// strings removed and duplicates dropped (first occurrence wins).
pub fn product_links(html: &str, base_url: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let link_sel = Selector::parse(r#".productListItem a[href^="/pd/"]"#).unwrap();
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    doc.select(&link_sel)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .map(|mut url| {
            url.set_query(None);
            url.set_fragment(None);
            String::from(url)
        })
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_encodes_terms() {
        let url = search_url("https://www.audible.com", "Dune", "Frank Herbert", 50).unwrap();
        assert_eq!(
            url,
            "https://www.audible.com/search?keywords=dune+frank+herbert&k=dune+frank+herbert&pageSize=50"
        );
    }

    #[test]
    fn links_are_scoped_stripped_and_unique() {
        let html = r##"<html><body>
            <a href="/pd/Header-Promo/B000000000">promo outside the list</a>
            <ul>
              <li class="productListItem">
                <a href="/pd/Dune-Audiobook/B002V1OF70?qid=1&ref=a">Dune</a>
                <a href="/pd/Dune-Audiobook/B002V1OF70?qid=2#reviews">Dune again</a>
                <a href="/author/Frank-Herbert">Frank Herbert</a>
              </li>
              <li class="productListItem">
                <a href="/pd/Dune-Messiah-Audiobook/B002V8KYE6">Dune Messiah</a>
              </li>
            </ul>
        </body></html>"##;

        let links = product_links(html, "https://www.audible.com");
        assert_eq!(
            links,
            vec![
                "https://www.audible.com/pd/Dune-Audiobook/B002V1OF70",
                "https://www.audible.com/pd/Dune-Messiah-Audiobook/B002V8KYE6",
            ]
        );
    }
}
