//! Source discovery: web search and marketplace search pages.
//!
//! [`WebSearch`] is the seam the pipeline searches through. [`BraveSearch`]
//! talks to the Brave Search web API; an LLM-backed implementation lives in
//! `bookgen-core` next to the LLM client.

pub mod marketplace;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bookgen_shared::{BookGenError, Result, SearchConfig};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument};

pub use marketplace::{product_links, search_url};

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 3;

/// Default timeout in seconds for search requests.
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Brave returns at most this many results per request.
const BRAVE_MAX_COUNT: usize = 20;

/// User-Agent string for search requests.
const USER_AGENT: &str = concat!("bookgen/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Search seam
// ---------------------------------------------------------------------------

/// One search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub query: String,
    pub num_results: usize,
    /// ISO 639-1 code, e.g. `en`.
    pub language: String,
    /// ISO 3166 code, e.g. `US`.
    pub country: String,
}

/// Finds URLs for a query.
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Result URLs in rank order, at most `query.num_results` of them.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<String>>;
}

/// Append `incoming` to `existing`, skipping URLs already present.
/// Order of first appearance is kept.
pub fn merge_urls(existing: &mut Vec<String>, incoming: impl IntoIterator<Item = String>) -> usize {
    let mut seen: HashSet<String> = existing.iter().cloned().collect();
    let before = existing.len();
    for url in incoming {
        let url = url.trim().to_string();
        if !url.is_empty() && seen.insert(url.clone()) {
            existing.push(url);
        }
    }
    existing.len() - before
}

// ---------------------------------------------------------------------------
// Brave
// ---------------------------------------------------------------------------

/// Brave Search web API client.
pub struct BraveSearch {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    url: String,
}

impl BraveSearch {
    /// Create a client for `endpoint` authenticated with `api_key`.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BookGenError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    /// Create a client from the `[search]` config, reading the key from the
    /// configured env var.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            BookGenError::config(format!(
                "search API key not found. Set the {} environment variable.",
                config.api_key_env
            ))
        })?;
        Self::new(config.endpoint.clone(), api_key)
    }
}

#[async_trait]
impl WebSearch for BraveSearch {
    #[instrument(skip_all, fields(query = %query.query))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<String>> {
        let count = query.num_results.clamp(1, BRAVE_MAX_COUNT).to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[
                ("q", query.query.as_str()),
                ("count", count.as_str()),
                ("search_lang", query.language.as_str()),
                ("country", query.country.as_str()),
            ])
            .send()
            .await
            .map_err(|e| BookGenError::Network(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BookGenError::Network(format!("search: HTTP {status}")));
        }

        let body: BraveResponse = response
            .json()
            .await
            .map_err(|e| BookGenError::parse(format!("search response: {e}")))?;

        let mut urls = Vec::new();
        merge_urls(
            &mut urls,
            body.web
                .map(|web| web.results)
                .unwrap_or_default()
                .into_iter()
                .map(|r| r.url),
        );
        urls.truncate(query.num_results);

        if urls.is_empty() {
            debug!("search returned no results");
        } else {
            info!(count = urls.len(), "search complete");
        }
        Ok(urls)
    }
}
