//! Source discovery and analysis stage.

use std::time::Instant;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use bookgen_discovery::{SearchQuery, merge_urls};
use bookgen_shared::{Result, Row, SourceSummary, cell_text, hashed_slug, project_key};

use crate::context::{ModelRole, StageContext};
use crate::fanout::{FanOutReport, fan_out};
use crate::llm::{LlmRequest, LlmTask};
use crate::prompts;
use crate::source::Source;

pub const SOURCE_URLS_TAB: &str = "Source URLs";
pub const REFINED_QUERIES_TAB: &str = "Refined Queries";
pub const SOURCE_INFO_TAB: &str = "Source Information";

const STAGE: &str = "sources";

#[derive(Debug, Deserialize)]
struct QueryList {
    #[serde(default)]
    queries: Vec<QueryItem>,
}

#[derive(Debug, Deserialize)]
struct QueryItem {
    #[serde(default)]
    query: String,
}

/// What a run of the stage produced.
#[derive(Debug, Clone, Default)]
pub struct SourceReport {
    pub urls: usize,
    pub analysed: usize,
    pub failed: Vec<(String, String)>,
    pub summaries: Vec<SourceSummary>,
}

/// Finds pages about the book and analyses them.
#[derive(Debug, Default)]
pub struct SourceFinder {
    urls: Vec<String>,
    queries: Vec<String>,
    sources: Vec<Source>,
}

impl SourceFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    /// Discover, analyse, widen the search with refined queries, analyse
    /// the newcomers and publish the ranked summary.
    #[instrument(skip_all, fields(title = %ctx.settings().title))]
    pub async fn run(&mut self, ctx: &StageContext<'_>) -> Result<SourceReport> {
        let start = Instant::now();
        ctx.progress.stage("Finding sources");

        self.urls = single_column(&ctx.read_tab(SOURCE_URLS_TAB).await?, "URL");
        if self.urls.is_empty() {
            let query = prompts::primary_search_query(ctx.settings());
            self.urls = self.search(ctx, &query).await?;
            self.save_urls(ctx).await?;
        }
        self.build_sources(ctx);
        self.analyse_all(ctx).await;

        ctx.progress.stage("Refining search");
        self.queries = single_column(&ctx.read_tab(REFINED_QUERIES_TAB).await?, "Query");
        let wanted = ctx.settings().num_search_refinements;
        if self.queries.len() < wanted {
            // The suggestion is checkpointed: a model that returns fewer
            // queries than asked must not be asked again on every run.
            let key = project_key(&ctx.settings().title, "refined_queries");
            let suggested = match ctx.load::<Vec<String>>(&key).await? {
                Some(queries) => Some(queries),
                None => match self.suggest_queries(ctx, wanted - self.queries.len()).await {
                    Ok(queries) => {
                        ctx.save(&key, &queries).await?;
                        Some(queries)
                    }
                    Err(e) => {
                        warn!(error = %e, "could not refine search queries");
                        None
                    }
                },
            };
            if let Some(queries) = suggested {
                merge_urls(&mut self.queries, queries);
                self.save_queries(ctx).await?;
            }
        }

        for query in self.queries.clone() {
            let found = self.search(ctx, &query).await?;
            merge_urls(&mut self.urls, found);
        }
        self.save_urls(ctx).await?;

        ctx.progress.stage("Analysing sources");
        self.build_sources(ctx);
        // Pages that failed the first pass are retried here too.
        let failed = self.analyse_all(ctx).await.failed;

        let summaries = self.summary();
        ctx.write_tab(SOURCE_INFO_TAB, &summary_rows(&summaries)).await?;

        let analysed = self
            .sources
            .iter()
            .filter(|s| s.analysis().is_some())
            .count();
        info!(
            urls = self.urls.len(),
            analysed,
            failed = failed.len(),
            summaries = summaries.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "source stage complete"
        );
        Ok(SourceReport {
            urls: self.urls.len(),
            analysed,
            failed,
            summaries,
        })
    }

    /// Summary rows of all analysed sources, best coverage first. Ties keep
    /// discovery order.
    pub fn summary(&self) -> Vec<SourceSummary> {
        let mut rows: Vec<SourceSummary> = self.sources.iter().flat_map(Source::summaries).collect();
        rows.sort_by(|a, b| b.coverage_rating.total_cmp(&a.coverage_rating));
        rows
    }

    /// Search results are checkpointed per query so reruns do not search
    /// again. An empty result is not stored: it is usually a failed or
    /// throttled search and the next run should try again.
    async fn search(&self, ctx: &StageContext<'_>, query: &str) -> Result<Vec<String>> {
        let key = project_key(&ctx.settings().title, &format!("search/{}", hashed_slug(query)));
        if let Some(urls) = ctx.load::<Vec<String>>(&key).await? {
            return Ok(urls);
        }

        let settings = ctx.settings();
        let request = SearchQuery {
            query: query.to_string(),
            num_results: settings.urls_per_search,
            language: settings.language.clone(),
            country: settings.country.clone(),
        };
        let urls = ctx.services.search.search(&request).await?;
        if urls.is_empty() {
            warn!(query, "search returned nothing");
            return Ok(urls);
        }
        info!(query, count = urls.len(), "search complete");
        ctx.save(&key, &urls).await?;
        Ok(urls)
    }

    async fn suggest_queries(&self, ctx: &StageContext<'_>, count: usize) -> Result<Vec<String>> {
        let request = LlmRequest::new(
            LlmTask::RefineQueries,
            ctx.model(ModelRole::General),
            prompts::refine_queries(ctx.settings(), count, &self.summary()),
        )
        .with_schema(prompts::queries_schema());
        let list: QueryList = ctx.llm().execute(&request).await.parse()?;
        Ok(list
            .queries
            .into_iter()
            .map(|q| q.query.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect())
    }

    /// One [`Source`] per URL not seen yet.
    fn build_sources(&mut self, ctx: &StageContext<'_>) {
        let title = &ctx.settings().title;
        for url in &self.urls {
            if !self.sources.iter().any(|s| &s.url == url) {
                self.sources.push(Source::new(title, url.clone()));
            }
        }
    }

    async fn analyse_all(&mut self, ctx: &StageContext<'_>) -> FanOutReport<()> {
        fan_out(
            STAGE,
            self.sources.iter_mut(),
            Some(ctx.limit),
            ctx.progress,
            |source| source.url.clone(),
            |source| async move { source.run_analysis(ctx).await },
        )
        .await
    }

    async fn save_urls(&self, ctx: &StageContext<'_>) -> Result<()> {
        ctx.write_tab(SOURCE_URLS_TAB, &column_rows("URL", &self.urls))
            .await
    }

    async fn save_queries(&self, ctx: &StageContext<'_>) -> Result<()> {
        ctx.write_tab(REFINED_QUERIES_TAB, &column_rows("Query", &self.queries))
            .await
    }
}

fn single_column(rows: &[Row], column: &str) -> Vec<String> {
    let mut values = Vec::new();
    merge_urls(&mut values, rows.iter().map(|row| cell_text(row.get(column))));
    values
}

fn column_rows(column: &str, values: &[String]) -> Vec<Row> {
    values
        .iter()
        .map(|value| {
            let mut row = Row::new();
            row.insert(column.into(), value.clone().into());
            row
        })
        .collect()
}

/// Rows of the `Source Information` tab.
pub fn summary_rows(summaries: &[SourceSummary]) -> Vec<Row> {
    summaries
        .iter()
        .filter_map(|s| match serde_json::to_value(s) {
            Ok(serde_json::Value::Object(row)) => Some(row),
            _ => None,
        })
        .collect()
}

/// Parse the `Source Information` tab back into summaries.
pub fn summaries_from_rows(rows: &[Row]) -> Vec<SourceSummary> {
    rows.iter()
        .filter_map(|row| {
            serde_json::from_value(serde_json::Value::Object(row.clone()))
                .map_err(|e| warn!(error = %e, "skipping unreadable source row"))
                .ok()
        })
        .collect()
}
