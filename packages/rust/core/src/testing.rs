//! In-memory collaborators for tests: a scripted LLM, canned pages and
//! search results, and a harness that wires them to a temporary database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use bookgen_crawler::{PageFetcher, PageKind, ScrapedPage, strip_query};
use bookgen_discovery::{SearchQuery, WebSearch};
use bookgen_shared::{AppConfig, BookGenError, ProjectSettings, Result, SETTINGS_TAB};
use bookgen_storage::{DocumentStore, Storage};

use crate::context::{ProjectContext, RunOptions, Services, StageContext};
use crate::feature_image::ImageComposer;
use crate::llm::{CachedLlm, LlmClient, LlmRequest, LlmResponse, LlmTask};
use crate::progress::SilentProgress;

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

type Rule = Box<dyn Fn(&LlmRequest) -> LlmResponse + Send + Sync>;

/// Answers requests by task. The first matching rule wins; a request no rule
/// covers gets a failed response.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Vec<(LlmTask, Rule)>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, task: LlmTask, text: impl Into<String>) -> Self {
        self.respond(task, LlmResponse::success(text))
    }

    pub fn fail(self, task: LlmTask, error: impl Into<String>) -> Self {
        self.respond(task, LlmResponse::failure(error))
    }

    pub fn respond(self, task: LlmTask, response: LlmResponse) -> Self {
        self.on_with(task, move |_| response.clone())
    }

    pub fn on_with(
        mut self,
        task: LlmTask,
        rule: impl Fn(&LlmRequest) -> LlmResponse + Send + Sync + 'static,
    ) -> Self {
        self.rules.push((task, Box::new(rule)));
        self
    }

    pub fn call_count(&self) -> usize {
        self.lock().len()
    }

    pub fn calls_for(&self, task: LlmTask) -> usize {
        self.lock().iter().filter(|r| r.task == task).count()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LlmRequest>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn execute(&self, request: &LlmRequest) -> LlmResponse {
        self.lock().push(request.clone());
        self.rules
            .iter()
            .find(|(task, _)| *task == request.task)
            .map(|(_, rule)| rule(request))
            .unwrap_or_else(|| {
                LlmResponse::failure(format!("no scripted answer for {}", request.task.as_str()))
            })
    }
}

// ---------------------------------------------------------------------------
// Fetcher and search
// ---------------------------------------------------------------------------

/// Serves canned HTML by URL. Query strings are ignored when no exact
/// match exists.
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, String>,
    fetches: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, html: impl Into<String>) -> Self {
        self.pages.insert(url.to_string(), html.into());
        self
    }

    /// Fetches of `url`, query string ignored.
    pub fn fetch_count(&self, url: &str) -> usize {
        let wanted = strip_query(url);
        self.lock().iter().filter(|u| strip_query(u) == wanted).count()
    }

    pub fn total_fetches(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.fetches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str, _kind: PageKind) -> Result<ScrapedPage> {
        self.lock().push(url.to_string());
        let html = self
            .pages
            .get(url)
            .or_else(|| self.pages.get(&strip_query(url)))
            .ok_or_else(|| BookGenError::Network(format!("HTTP 404 for {url}")))?;
        ScrapedPage::from_html(url, html.clone())
    }
}

/// Canned search results by exact query text.
#[derive(Default)]
pub struct StaticSearch {
    results: HashMap<String, Vec<String>>,
    fallback: Vec<String>,
    queries: Mutex<Vec<String>>,
}

impl StaticSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(mut self, query: &str, urls: &[&str]) -> Self {
        self.results
            .insert(query.to_string(), urls.iter().map(|u| u.to_string()).collect());
        self
    }

    /// Results for any query without its own entry.
    pub fn default_results(mut self, urls: &[&str]) -> Self {
        self.fallback = urls.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn call_count(&self) -> usize {
        self.lock().len()
    }

    pub fn queries(&self) -> Vec<String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.queries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WebSearch for StaticSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<String>> {
        self.lock().push(query.query.clone());
        let urls = self.results.get(&query.query).unwrap_or(&self.fallback);
        Ok(urls.iter().take(query.num_results).cloned().collect())
    }
}

/// Records what it was asked to compose and writes nothing.
#[derive(Default)]
pub struct NullComposer {
    sets: Mutex<Vec<Vec<String>>>,
}

impl NullComposer {
    pub fn compositions(&self) -> Vec<Vec<String>> {
        self.sets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ImageComposer for NullComposer {
    async fn compose(&self, covers: &[String], output: &Path) -> Result<PathBuf> {
        self.sets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(covers.to_vec());
        Ok(output.to_path_buf())
    }
}

// ---------------------------------------------------------------------------
// HTML builders
// ---------------------------------------------------------------------------

/// A plain article page.
pub fn page_html(title: &str, body: &str) -> String {
    format!(
        "<html><head><title>{title}</title></head><body><article><h1>{title}</h1><p>{body}</p></article></body></html>"
    )
}

/// A marketplace product page with an `Audiobook` ld+json block.
pub fn listing_html(
    title: &str,
    author: &str,
    narrators: &[&str],
    language: &str,
    rating_count: u64,
) -> String {
    let data = json!({
        "@type": "Audiobook",
        "name": title,
        "author": [{"name": author}],
        "readBy": narrators.iter().map(|n| json!({"name": n})).collect::<Vec<_>>(),
        "inLanguage": language,
        "abridged": "false",
        "duration": "PT21H2M",
        "image": format!("https://img.example/{}.jpg", title.to_lowercase().replace(' ', "-")),
        "aggregateRating": {"ratingValue": "4.6", "ratingCount": rating_count.to_string()},
    });
    format!(
        r#"<html><head><script type="application/ld+json">{data}</script></head><body><h1>{title}</h1><adbl-text-block slot="summary">The audiobook of {title}.</adbl-text-block></body></html>"#
    )
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Test doubles wired into [`Services`] over a temporary database and
/// document root.
#[derive(Clone)]
pub struct Harness {
    pub services: Services,
    pub llm: Arc<ScriptedLlm>,
    pub fetcher: Arc<StaticFetcher>,
    pub search: Arc<StaticSearch>,
    pub composer: Arc<NullComposer>,
}

impl Harness {
    pub async fn new(llm: ScriptedLlm, fetcher: StaticFetcher, search: StaticSearch) -> Self {
        let id = Uuid::now_v7();
        let db_path = std::env::temp_dir().join(format!("bg_test_{id}.db"));
        let doc_root = std::env::temp_dir().join(format!("bg_docs_{id}"));
        let storage = Storage::open(&db_path).await.expect("open test db");

        let mut config = AppConfig::default();
        config.defaults.data_dir = doc_root.to_string_lossy().into_owned();
        config.marketplace.base_url = "https://www.audible.com".into();

        let llm = Arc::new(llm);
        let fetcher = Arc::new(fetcher);
        let search = Arc::new(search);
        let composer = Arc::new(NullComposer::default());
        let services = Services {
            config,
            storage: Arc::new(storage),
            documents: DocumentStore::new(doc_root),
            llm: llm.clone(),
            search: search.clone(),
            fetcher: fetcher.clone(),
            composer: composer.clone(),
        };
        Self {
            services,
            llm,
            fetcher,
            search,
            composer,
        }
    }

    /// Same storage, documents, pages and search; a new LLM.
    pub fn with_llm(&self, llm: ScriptedLlm) -> Self {
        let llm = Arc::new(llm);
        let mut harness = self.clone();
        harness.services.llm = llm.clone();
        harness.llm = llm;
        harness
    }

    /// LLM calls go through the response cache in the harness database;
    /// `llm` still sees every call that reaches the provider.
    pub fn with_response_cache(&self) -> Self {
        let mut harness = self.clone();
        harness.services.llm = Arc::new(CachedLlm::new(
            self.llm.clone(),
            self.services.storage.clone(),
        ));
        harness
    }

    /// Same storage, documents, LLM and search; new pages.
    pub fn with_fetcher(&self, fetcher: StaticFetcher) -> Self {
        let fetcher = Arc::new(fetcher);
        let mut harness = self.clone();
        harness.services.fetcher = fetcher.clone();
        harness.fetcher = fetcher;
        harness
    }

    pub async fn project(&self, title: &str, author: &str) -> ProjectContext {
        self.project_with(ProjectSettings::new(title, author)).await
    }

    /// Create a project with the given settings and load it back.
    pub async fn project_with(&self, settings: ProjectSettings) -> ProjectContext {
        let storage = &self.services.storage;
        let name = format!("(en) {} - {}", settings.author, settings.title);
        let id = storage
            .insert_project(&name, &settings.title, &settings.author)
            .await
            .expect("insert project")
            .to_string();
        storage
            .write_tab(&id, SETTINGS_TAB, &settings.to_rows(), true)
            .await
            .expect("write settings");
        ProjectContext::load(storage, &name).await.expect("load project")
    }

    pub fn run_scope<'a>(&'a self, project: &'a ProjectContext) -> RunScope<'a> {
        self.run_scope_with(project, RunOptions::default())
    }

    pub fn run_scope_with<'a>(
        &'a self,
        project: &'a ProjectContext,
        options: RunOptions,
    ) -> RunScope<'a> {
        RunScope {
            services: &self.services,
            project,
            options,
            limit: Semaphore::new(self.services.config.defaults.fanout_concurrency),
            progress: SilentProgress,
        }
    }
}

/// Owns the per-run pieces a [`StageContext`] borrows.
pub struct RunScope<'a> {
    services: &'a Services,
    project: &'a ProjectContext,
    options: RunOptions,
    limit: Semaphore,
    progress: SilentProgress,
}

impl RunScope<'_> {
    pub fn ctx(&self) -> StageContext<'_> {
        StageContext {
            services: self.services,
            project: self.project,
            options: &self.options,
            limit: &self.limit,
            progress: &self.progress,
        }
    }
}
