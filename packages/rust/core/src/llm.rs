//! LLM adapter.
//!
//! Every call goes through [`LlmClient::execute`], which never returns an
//! error: provider failures come back as a failed [`LlmResponse`] that the
//! caller inspects with [`LlmResponse::is_failed`] / [`LlmResponse::error`].
//! [`OpenRouterClient`] speaks the OpenAI-compatible chat API, [`CachedLlm`]
//! memoises successful responses in storage and [`LlmSearch`] turns a
//! search-capable model into a [`WebSearch`].

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use bookgen_discovery::{SearchQuery, WebSearch, merge_urls};
use bookgen_shared::{BookGenError, LlmConfig, Result};
use bookgen_storage::Storage;

use crate::prompts;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// What an LLM call is for. Part of the cache key and the name of the
/// response schema sent to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmTask {
    AnalyseSource,
    RefineQueries,
    SynthesizeTopics,
    WriteDraft,
    RefineTopic,
    EnforceLanguage,
    ResearchKeyFacts,
    OrganizeKeyFacts,
    SynthesizeFacts,
    JudgeListing,
    DescribeAudiobooks,
    WriteLeadIn,
    Search,
}

impl LlmTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalyseSource => "analyse_source",
            Self::RefineQueries => "refine_queries",
            Self::SynthesizeTopics => "synthesize_topics",
            Self::WriteDraft => "write_draft",
            Self::RefineTopic => "refine_topic",
            Self::EnforceLanguage => "enforce_language",
            Self::ResearchKeyFacts => "research_key_facts",
            Self::OrganizeKeyFacts => "organize_key_facts",
            Self::SynthesizeFacts => "synthesize_facts",
            Self::JudgeListing => "judge_listing",
            Self::DescribeAudiobooks => "describe_audiobooks",
            Self::WriteLeadIn => "write_lead_in",
            Self::Search => "search",
        }
    }
}

/// One LLM call.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub task: LlmTask,
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    /// `0` means the client's configured default.
    pub max_tokens: u32,
    /// JSON schema the answer must follow. `None` for free text.
    pub schema: Option<Value>,
    /// Project the call is made for. Not part of the cache key.
    #[serde(skip)]
    pub scope: Option<String>,
}

impl LlmRequest {
    pub fn new(task: LlmTask, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task,
            model: model.into(),
            prompt: prompt.into(),
            temperature: 0.2,
            max_tokens: 0,
            schema: None,
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// SHA-256 over everything that shapes the answer.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.task.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.model.as_bytes());
        hasher.update([0]);
        hasher.update(self.prompt.as_bytes());
        hasher.update([0]);
        if let Some(schema) = &self.schema {
            hasher.update(schema.to_string().as_bytes());
        }
        hasher.update([0]);
        hasher.update(self.temperature.to_bits().to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Outcome of one LLM call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    content: String,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

impl LlmResponse {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_citations(mut self, citations: Vec<String>) -> Self {
        self.citations = citations;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Answer text; empty for a failed call.
    pub fn text(&self) -> &str {
        &self.content
    }

    /// URLs the provider cited, if it reports any.
    pub fn citations(&self) -> &[String] {
        &self.citations
    }

    /// Free-text answer, or an error for a failed call.
    pub fn into_text(self) -> Result<String> {
        match self.error {
            Some(error) => Err(BookGenError::Llm(error)),
            None => Ok(self.content),
        }
    }

    /// Answer parsed as JSON. Tolerates a Markdown code fence around it.
    pub fn json(&self) -> Result<Value> {
        if let Some(error) = &self.error {
            return Err(BookGenError::Llm(error.clone()));
        }
        let body = strip_json_fence(&self.content);
        serde_json::from_str(body)
            .map_err(|e| BookGenError::parse(format!("LLM answer is not valid JSON: {e}")))
    }

    /// Answer parsed into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.json()?)
            .map_err(|e| BookGenError::parse(format!("unexpected LLM answer shape: {e}")))
    }
}

fn strip_json_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Executes LLM requests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn execute(&self, request: &LlmRequest) -> LlmResponse;
}

/// Tags every request with the project it is made for, so cached answers
/// can be dropped with the project's checkpoints.
#[derive(Clone, Copy)]
pub struct ScopedLlm<'a> {
    inner: &'a dyn LlmClient,
    scope: &'a str,
}

impl<'a> ScopedLlm<'a> {
    pub fn new(inner: &'a dyn LlmClient, scope: &'a str) -> Self {
        Self { inner, scope }
    }

    pub async fn execute(&self, request: &LlmRequest) -> LlmResponse {
        if request.scope.is_some() {
            return self.inner.execute(request).await;
        }
        let scoped = request.clone().with_scope(self.scope);
        self.inner.execute(&scoped).await
    }
}

// ---------------------------------------------------------------------------
// OpenRouter
// ---------------------------------------------------------------------------

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenRouterClient {
    client: Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    max_output_tokens: u32,
    backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize)]
struct Annotation {
    #[serde(default)]
    url_citation: Option<UrlCitation>,
}

#[derive(Debug, Deserialize)]
struct UrlCitation {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl OpenRouterClient {
    /// Create a client for `base_url` with an explicit key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BookGenError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_retries: config.max_retries,
            max_output_tokens: config.max_output_tokens,
            backoff: Duration::from_secs(2),
        })
    }

    /// Create a client from the `[llm]` config, reading the key from the
    /// configured env var.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            BookGenError::config(format!(
                "LLM API key not found. Set the {} environment variable.",
                config.api_key_env
            ))
        })?;
        Self::new(config.base_url.clone(), api_key, config)
    }

    /// Base delay before the first retry; doubled for every further attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn body(&self, request: &LlmRequest) -> Value {
        let max_tokens = if request.max_tokens == 0 {
            self.max_output_tokens
        } else {
            request.max_tokens
        };
        let mut body = json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "max_tokens": max_tokens,
        });
        if let Some(schema) = &request.schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.task.as_str(),
                    "strict": true,
                    "schema": schema,
                },
            });
        }
        body
    }

    async fn call_once(&self, body: &Value) -> std::result::Result<LlmResponse, Attempt> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Attempt::Retry(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {}", text.chars().take(200).collect::<String>());
            return Err(
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    Attempt::Retry(message)
                } else {
                    Attempt::Fatal(message)
                },
            );
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Retry(format!("unreadable response: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(Attempt::Fatal(error.message));
        }
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(Attempt::Retry("response has no choices".into()));
        };

        let mut citations = parsed.citations;
        merge_urls(
            &mut citations,
            choice
                .message
                .annotations
                .into_iter()
                .filter_map(|a| a.url_citation.map(|c| c.url)),
        );
        Ok(LlmResponse::success(choice.message.content.unwrap_or_default()).with_citations(citations))
    }
}

/// Outcome of one failed attempt.
enum Attempt {
    Retry(String),
    Fatal(String),
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    #[instrument(skip_all, fields(task = request.task.as_str(), model = %request.model))]
    async fn execute(&self, request: &LlmRequest) -> LlmResponse {
        let body = self.body(request);
        let mut attempt = 0;
        loop {
            match self.call_once(&body).await {
                Ok(response) => {
                    debug!(attempt, chars = response.text().len(), "LLM call complete");
                    return response;
                }
                Err(Attempt::Fatal(message)) => {
                    warn!(error = %message, "LLM call failed");
                    return LlmResponse::failure(message);
                }
                Err(Attempt::Retry(message)) if attempt >= self.max_retries => {
                    warn!(error = %message, attempts = attempt + 1, "LLM call gave up");
                    return LlmResponse::failure(format!(
                        "{message} (gave up after {} attempts)",
                        attempt + 1
                    ));
                }
                Err(Attempt::Retry(message)) => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    warn!(attempt, error = %message, delay_ms = delay.as_millis() as u64, "LLM call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Response cache
// ---------------------------------------------------------------------------

/// Serves repeated requests from the `llm_cache` table. Failed responses are
/// never stored; entries older than the TTL are asked again.
pub struct CachedLlm {
    inner: Arc<dyn LlmClient>,
    storage: Arc<Storage>,
    refresh: bool,
    ttl: Option<chrono::Duration>,
}

impl CachedLlm {
    pub fn new(inner: Arc<dyn LlmClient>, storage: Arc<Storage>) -> Self {
        Self {
            inner,
            storage,
            refresh: false,
            ttl: None,
        }
    }

    /// Skip cache reads (responses are still written).
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<chrono::Duration>) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl LlmClient for CachedLlm {
    async fn execute(&self, request: &LlmRequest) -> LlmResponse {
        let key = request.cache_key();

        if !self.refresh {
            match self.storage.get_llm_cache(&key, &request.model, self.ttl).await {
                Ok(Some(cached)) => match serde_json::from_str::<LlmResponse>(&cached) {
                    Ok(response) => {
                        debug!(task = request.task.as_str(), "LLM cache hit");
                        return response;
                    }
                    Err(e) => warn!(error = %e, "discarding unreadable LLM cache entry"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "LLM cache lookup failed"),
            }
        }

        let response = self.inner.execute(request).await;
        if !response.is_failed() {
            match serde_json::to_string(&response) {
                Ok(json) => {
                    let scope = request.scope.as_deref().unwrap_or_default();
                    if let Err(e) = self.storage.set_llm_cache(&key, &request.model, scope, &json).await {
                        warn!(error = %e, "failed to cache LLM response");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialise LLM response"),
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// LLM-backed search
// ---------------------------------------------------------------------------

/// Web search through a model with browsing. A failed call yields no URLs.
pub struct LlmSearch {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl LlmSearch {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }
}

#[async_trait]
impl WebSearch for LlmSearch {
    #[instrument(skip_all, fields(query = %query.query))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<String>> {
        let request = LlmRequest::new(LlmTask::Search, &self.model, prompts::search(query));
        let response = self.llm.execute(&request).await;
        if let Some(error) = response.error() {
            warn!(error, "LLM search failed, continuing without results");
            return Ok(Vec::new());
        }

        let mut urls = response.citations().to_vec();
        merge_urls(&mut urls, extract_urls(response.text()));
        urls.truncate(query.num_results);
        info!(count = urls.len(), "LLM search complete");
        Ok(urls)
    }
}

/// Bare `http(s)` URLs in free text, in order of appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"https?://[^\s<>()\[\]"'`]+"#).expect("valid regex")
    });

    URL_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']).to_string())
        .collect()
}
