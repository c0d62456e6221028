//! Page fetching with per-request timeout and bounded retries.
//!
//! [`PageFetcher`] is the seam the pipeline talks to; [`Scraper`] is the
//! reqwest-backed implementation.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use url::Url;

use bookgen_shared::{BookGenError, Result, ScrapeConfig};

/// User-Agent string for page requests.
const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; bookgen/",
    env!("CARGO_PKG_VERSION"),
    ")"
);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which retry budget a fetch uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// A web page found by search.
    Source,
    /// A marketplace product page.
    Product,
}

/// A fetched page in raw and converted form.
#[derive(Debug, Clone, Default)]
pub struct ScrapedPage {
    /// URL after redirects.
    pub url: String,
    pub html: String,
    pub text: String,
    pub markdown: String,
    pub title: Option<String>,
    /// SHA-256 of the HTML body.
    pub content_hash: String,
}

impl ScrapedPage {
    /// Build a page from HTML that was obtained some other way.
    pub fn from_html(url: &str, html: String) -> Result<Self> {
        let converted = bookgen_markdown::convert_page(&html, url)?;
        Ok(Self {
            url: url.to_string(),
            content_hash: compute_hash(&html),
            html,
            text: converted.text,
            markdown: converted.markdown,
            title: converted.title,
        })
    }
}

/// Fetches pages for the pipeline.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch `url` and convert it. Fails once the retry budget for `kind`
    /// is exhausted.
    async fn fetch(&self, url: &str, kind: PageKind) -> Result<ScrapedPage>;
}

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

/// HTTP page fetcher with timeout, retries and exponential backoff.
pub struct Scraper {
    client: Client,
    max_retries: u32,
    product_max_retries: u32,
    backoff: Duration,
    /// Allow localhost/private IPs (for tests against mock servers).
    allow_localhost: bool,
}

impl Scraper {
    /// Create a scraper from the `[scrape]` config section.
    pub fn new(config: &ScrapeConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BookGenError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            product_max_retries: config.product_max_retries,
            backoff: Duration::from_millis(500),
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs.
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Base delay before the first retry; doubled for every further attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn retries_for(&self, kind: PageKind) -> u32 {
        match kind {
            PageKind::Source => self.max_retries,
            PageKind::Product => self.product_max_retries,
        }
    }

    async fn fetch_once(&self, url: &Url) -> std::result::Result<(String, String), Attempt> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| Attempt::Retry(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("{url}: HTTP {status}");
            return Err(if is_retryable(status) {
                Attempt::Retry(message)
            } else {
                Attempt::Fatal(message)
            });
        }

        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Attempt::Retry(format!("{url}: body read failed: {e}")))?;
        Ok((final_url, body))
    }
}

/// Outcome of one failed attempt.
enum Attempt {
    Retry(String),
    Fatal(String),
}

#[async_trait]
impl PageFetcher for Scraper {
    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &str, kind: PageKind) -> Result<ScrapedPage> {
        let parsed = Url::parse(url).map_err(|e| BookGenError::parse(format!("{url}: {e}")))?;
        if !self.allow_localhost && is_ssrf_target(&parsed) {
            return Err(BookGenError::validation(format!("{url}: blocked address")));
        }

        let retries = self.retries_for(kind);
        let mut attempt = 0;
        loop {
            match self.fetch_once(&parsed).await {
                Ok((final_url, body)) => {
                    debug!(attempt, bytes = body.len(), "page fetched");
                    return ScrapedPage::from_html(&final_url, body);
                }
                Err(Attempt::Fatal(message)) => return Err(BookGenError::Network(message)),
                Err(Attempt::Retry(message)) if attempt >= retries => {
                    return Err(BookGenError::Network(format!(
                        "{message} (gave up after {} attempts)",
                        attempt + 1
                    )));
                }
                Err(Attempt::Retry(message)) => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    warn!(attempt, error = %message, delay_ms = delay.as_millis() as u64, "fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Throttling and server errors are worth another try; other client errors
/// are not.
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Compute SHA-256 hash of content.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
