//! Project bootstrap and the ASIN queue.

use tracing::{error, info, instrument, warn};

use bookgen_crawler::{PageKind, parse_listing, with_country_override};
use bookgen_shared::{
    BookGenError, ProjectSettings, Result, Row, SETTINGS_TAB, cell_text, value_to_f64,
};
use bookgen_storage::GLOBAL_SCOPE;

use crate::context::{ProjectContext, RunOptions, Services};
use crate::generator::{BookGenerator, RunReport};
use crate::progress::ProgressReporter;

/// Global tab of books waiting to be written.
pub const QUEUE_TAB: &str = "Queue";

/// Longest author or title fragment in a project name.
const NAME_PART_CHARS: usize = 50;

/// Project handle: `({language}) {author} - {title}`, with everything but
/// ASCII letters, digits and spaces removed.
pub fn project_name(language: &str, author: &str, title: &str) -> String {
    fn clean(text: &str) -> String {
        text.chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
            .take(NAME_PART_CHARS)
            .collect::<String>()
            .trim()
            .to_string()
    }
    format!("({language}) {} - {}", clean(author), clean(title))
}

/// What a new project is created from.
#[derive(Debug, Clone)]
pub struct BookRequest {
    pub title: String,
    pub author: String,
    pub language: String,
    pub country: String,
    pub asin: Option<String>,
}

/// Creates projects and runs them.
pub struct BookWorker<'a> {
    services: &'a Services,
}

impl<'a> BookWorker<'a> {
    pub fn new(services: &'a Services) -> Self {
        Self { services }
    }

    /// Create the project for a book, or load it when it already exists.
    #[instrument(skip_all, fields(title = %request.title, author = %request.author))]
    pub async fn init(&self, request: &BookRequest) -> Result<ProjectContext> {
        if request.title.trim().is_empty() || request.author.trim().is_empty() {
            return Err(BookGenError::validation("a book needs a title and an author"));
        }
        let storage = &self.services.storage;
        let name = project_name(&request.language, &request.author, &request.title);
        if storage.get_project(&name).await?.is_some() {
            info!(project = %name, "project exists");
            return ProjectContext::load(storage, &name).await;
        }

        let mut settings = ProjectSettings::new(request.title.trim(), request.author.trim());
        settings.language = request.language.clone();
        settings.country = request.country.clone();
        settings.asin = request.asin.clone();

        let id = storage
            .insert_project(&name, &settings.title, &settings.author)
            .await?
            .to_string();
        storage
            .write_tab(&id, SETTINGS_TAB, &settings.to_rows(), true)
            .await?;
        info!(project = %name, "project created");
        ProjectContext::load(storage, &name).await
    }

    /// Create the project for a marketplace listing; title and author are
    /// read from the product page.
    #[instrument(skip_all, fields(asin = %asin))]
    pub async fn init_from_asin(&self, asin: &str, language: &str, country: &str) -> Result<ProjectContext> {
        let base = self.services.config.marketplace.base_url.trim_end_matches('/');
        let url = format!("{base}/pd/{}", asin.trim());
        let page = self
            .services
            .fetcher
            .fetch(&with_country_override(&url)?, PageKind::Product)
            .await?;
        let listing = parse_listing(&page.html, &url)?;
        let author = listing.authors.first().cloned().unwrap_or_default();
        self.init(&BookRequest {
            title: listing.title,
            author,
            language: language.to_string(),
            country: country.to_string(),
            asin: Some(asin.trim().to_string()),
        })
        .await
    }

    /// Run the whole pipeline for a project.
    pub async fn run(
        &self,
        project: &mut ProjectContext,
        options: RunOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        BookGenerator::new(self.services, options)
            .with_progress(progress)
            .run(project)
            .await
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Outcome of one queue pass.
#[derive(Debug, Clone, Default)]
pub struct QueueReport {
    pub done: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Works through the `Queue` tab. Open rows have `Done == 0`; a finished
/// row gets `Done = 1` and the article URL in `Text`, a failed one
/// `Done = -1` and the error in `Exception`.
pub struct AsinListWorker<'a> {
    services: &'a Services,
}

impl<'a> AsinListWorker<'a> {
    pub fn new(services: &'a Services) -> Self {
        Self { services }
    }

    /// Append a row to the queue.
    pub async fn add(&self, asin: &str, language: &str, country: &str) -> Result<()> {
        let asin = asin.trim();
        if asin.is_empty() {
            return Err(BookGenError::validation("empty ASIN"));
        }
        let mut row = Row::new();
        row.insert("ASIN".into(), asin.into());
        row.insert("Language".into(), language.into());
        row.insert("Country".into(), country.into());
        row.insert("Done".into(), 0.into());
        self.services
            .storage
            .write_tab(GLOBAL_SCOPE, QUEUE_TAB, &[row], false)
            .await?;
        info!(asin, "queued");
        Ok(())
    }

    pub async fn rows(&self) -> Result<Vec<Row>> {
        self.services.storage.read_tab(GLOBAL_SCOPE, QUEUE_TAB).await
    }

    /// Rows still waiting to be processed.
    pub async fn open_rows(&self) -> Result<Vec<Row>> {
        Ok(self
            .rows()
            .await?
            .into_iter()
            .filter(|row| row.get("Done").is_none_or(|done| value_to_f64(done) == 0.0))
            .collect())
    }

    /// Process up to `limit` open rows, one after another.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        limit: Option<usize>,
        options: RunOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<QueueReport> {
        let open = self.open_rows().await?;
        let take = limit.unwrap_or(open.len());
        info!(open = open.len(), take, "processing queue");

        let mut report = QueueReport::default();
        for row in open.into_iter().take(take) {
            let asin = cell_text(row.get("ASIN"));
            if asin.is_empty() {
                warn!("queue row without ASIN");
                continue;
            }
            match self.run_row(&row, &asin, options.clone(), progress).await {
                Ok(url) => {
                    let mut updates = Row::new();
                    updates.insert("Text".into(), url.into());
                    updates.insert("Done".into(), 1.into());
                    self.update(&asin, &updates).await?;
                    report.done.push(asin);
                }
                Err(e) => {
                    error!(asin = %asin, error = %e, "queue row failed");
                    let mut updates = Row::new();
                    updates.insert("Exception".into(), e.to_string().into());
                    updates.insert("Done".into(), (-1).into());
                    self.update(&asin, &updates).await?;
                    report.failed.push((asin, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn run_row(
        &self,
        row: &Row,
        asin: &str,
        options: RunOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<String> {
        let language = non_empty(cell_text(row.get("Language")), "en");
        let country = non_empty(cell_text(row.get("Country")), "US");
        let worker = BookWorker::new(self.services);
        let mut project = worker.init_from_asin(asin, &language, &country).await?;

        let mut updates = Row::new();
        updates.insert("Author".into(), project.settings.author.clone().into());
        updates.insert("Title".into(), project.settings.title.clone().into());
        updates.insert("Project".into(), project.project.name.clone().into());
        self.update(asin, &updates).await?;

        let report = worker.run(&mut project, options, progress).await?;
        Ok(report.article.url)
    }

    async fn update(&self, asin: &str, updates: &Row) -> Result<()> {
        self.services
            .storage
            .update_row(GLOBAL_SCOPE, QUEUE_TAB, "ASIN", asin, updates)
            .await?;
        Ok(())
    }
}

fn non_empty(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
