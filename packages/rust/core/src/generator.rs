//! End-to-end run of one project.

use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{info, instrument};

use bookgen_shared::Result;

use crate::article_writer::{ArticleReport, ArticleWriter, Injections};
use crate::audible_finder::{AudibleFinder, AudibleReport};
use crate::context::{ProjectContext, RunOptions, Services, StageContext};
use crate::facts::FactFinder;
use crate::meta::MetaWriter;
use crate::progress::{ProgressReporter, SilentProgress};
use crate::source_finder::{SourceFinder, SourceReport};
use crate::topic_finder::TopicFinder;

/// Setting that receives the URL of the finished article.
pub const FINAL_ARTICLE_SETTING: &str = "Final Article";

/// Outcome of a full run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub sources: SourceReport,
    pub topics: usize,
    pub audiobooks: AudibleReport,
    pub article: ArticleReport,
}

impl RunReport {
    pub fn summary(&self) -> String {
        format!(
            "{} sources analysed, {} topics, {} audiobook editions, {} words: {}",
            self.sources.analysed,
            self.topics,
            self.audiobooks.selected,
            self.article.words,
            self.article.url
        )
    }
}

/// Runs the stages of a project in order. Every stage reloads what earlier
/// runs stored, so a rerun only pays for work that is still missing.
pub struct BookGenerator<'a> {
    services: &'a Services,
    options: RunOptions,
    progress: &'a dyn ProgressReporter,
}

impl<'a> BookGenerator<'a> {
    pub fn new(services: &'a Services, options: RunOptions) -> Self {
        Self {
            services,
            options,
            progress: &SilentProgress,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Run every stage and record the article URL in the project settings.
    #[instrument(skip_all, fields(project = %project.project.name, fresh = self.options.fresh))]
    pub async fn run(&self, project: &mut ProjectContext) -> Result<RunReport> {
        let start = Instant::now();
        let report = self.run_stages(project).await?;

        project
            .set(&self.services.storage, FINAL_ARTICLE_SETTING, &report.article.url)
            .await?;
        self.services.storage.touch_project(project.id()).await?;

        let summary = report.summary();
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "{summary}");
        self.progress.done(&summary);
        Ok(report)
    }

    async fn run_stages(&self, project: &ProjectContext) -> Result<RunReport> {
        let limit = Semaphore::new(self.services.config.defaults.fanout_concurrency.max(1));
        let ctx = StageContext {
            services: self.services,
            project,
            options: &self.options,
            limit: &limit,
            progress: self.progress,
        };

        let mut source_finder = SourceFinder::new();
        let sources = source_finder.run(&ctx).await?;

        let mut topic_finder = TopicFinder::new();
        topic_finder.run(&ctx).await?;
        let (records, topics) = topic_finder.into_topics();
        let topic_count = topics.len();

        let mut audible = AudibleFinder::new();
        let audiobooks = audible.run(&ctx).await?;

        let facts = FactFinder::new();
        let meta = MetaWriter::new();
        let injections = Injections {
            facts: &facts,
            audible: &audible,
            meta: &meta,
            sources: source_finder.sources(),
        };
        let mut writer = ArticleWriter::new(records, topics);
        let article = writer.run(&ctx, &injections).await?;

        Ok(RunReport {
            sources,
            topics: topic_count,
            audiobooks,
            article,
        })
    }
}
