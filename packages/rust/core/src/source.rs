//! A web page found by search, its text and its analysis.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use bookgen_crawler::PageKind;
use bookgen_shared::{BookGenError, ItemStatus, Result, SourceSummary, source_key};

use crate::context::{ModelRole, StageContext};
use crate::llm::{LlmRequest, LlmTask};
use crate::prompts;

/// Structured analysis of one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceAnalysis {
    #[serde(default)]
    pub content_analysis: Vec<ContentArea>,
    #[serde(default)]
    pub interesting_facts: Vec<Fact>,
}

/// One content area of a page, as rated by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentArea {
    #[serde(default)]
    pub content_name: String,
    #[serde(default)]
    pub coverage_rating: serde_json::Value,
    #[serde(default)]
    pub analysis_notes: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    #[serde(default)]
    pub fact: String,
}

/// Checkpointed state of a [`Source`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub status: ItemStatus,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub analysis: Option<SourceAnalysis>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A discovered page. Identity is the URL.
#[derive(Debug, Clone)]
pub struct Source {
    pub url: String,
    key: String,
    state: SourceState,
    loaded: bool,
}

impl Source {
    pub fn new(title: &str, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            key: source_key(title, &url),
            url,
            state: SourceState::default(),
            loaded: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> ItemStatus {
        self.state.status
    }

    pub fn text(&self) -> Option<&str> {
        self.state.text.as_deref()
    }

    pub fn analysis(&self) -> Option<&SourceAnalysis> {
        self.state.analysis.as_ref()
    }

    /// Pick up whatever an earlier run stored for this page.
    pub async fn load(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        if let Some(state) = ctx.load::<SourceState>(&self.key).await? {
            debug!(url = %self.url, status = ?state.status, "source restored");
            self.state = state;
        }
        self.loaded = true;
        Ok(())
    }

    /// Whether the text is long enough to be worth an analysis call.
    pub fn is_long_enough_for_analysis(&self, min_length: usize) -> bool {
        self.text()
            .is_some_and(|text| text.chars().count() >= min_length)
    }

    /// Nothing left to do for this page.
    pub fn is_complete(&self, min_length: usize) -> bool {
        match self.state.status {
            ItemStatus::Analyzed => true,
            ItemStatus::Fetched => !self.is_long_enough_for_analysis(min_length),
            ItemStatus::Pending | ItemStatus::Failed => false,
        }
    }

    /// Fetch the page if needed, then analyse it if it is long enough.
    /// Every completed step is checkpointed before moving on.
    #[instrument(skip_all, fields(url = %self.url))]
    pub async fn run_analysis(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        self.load(ctx).await?;
        let min_length = ctx.settings().min_source_length;
        if self.is_complete(min_length) {
            return Ok(());
        }

        match self.advance(ctx, min_length).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.status = ItemStatus::Failed;
                self.state.error = Some(e.to_string());
                ctx.save(&self.key, &self.state).await?;
                Err(e)
            }
        }
    }

    async fn advance(&mut self, ctx: &StageContext<'_>, min_length: usize) -> Result<()> {
        if self.state.text.is_none() {
            let page = ctx.services.fetcher.fetch(&self.url, PageKind::Source).await?;
            let text = if page.markdown.trim().is_empty() {
                page.text
            } else {
                page.markdown
            };
            debug!(chars = text.chars().count(), "source text fetched");
            self.state.text = Some(text);
            self.state.status = ItemStatus::Fetched;
            self.state.error = None;
            ctx.save(&self.key, &self.state).await?;
        }

        if self.state.analysis.is_none() && self.is_long_enough_for_analysis(min_length) {
            let text = self.text().unwrap_or_default();
            let request = LlmRequest::new(
                LlmTask::AnalyseSource,
                ctx.model(ModelRole::General),
                prompts::analyse_source(ctx.settings(), &self.url, text),
            )
            .with_schema(prompts::source_analysis_schema());
            let analysis: SourceAnalysis = ctx.llm().execute(&request).await.parse()?;
            self.state.analysis = Some(analysis);
        }

        self.state.status = if self.state.analysis.is_some() {
            ItemStatus::Analyzed
        } else {
            ItemStatus::Fetched
        };
        self.state.error = None;
        ctx.save(&self.key, &self.state).await
    }

    /// One summary row per analysed content area. Pages too short to
    /// analyse contribute nothing.
    pub fn summaries(&self) -> Vec<SourceSummary> {
        let Some(analysis) = &self.state.analysis else {
            return Vec::new();
        };
        analysis
            .content_analysis
            .iter()
            .filter_map(|area| {
                let row = serde_json::json!({
                    "url": self.url,
                    "content_name": area.content_name,
                    "coverage_rating": area.coverage_rating,
                    "analysis_notes": area.analysis_notes,
                });
                serde_json::from_value(row).ok()
            })
            .collect()
    }

    pub fn interesting_facts(&self) -> Vec<String> {
        self.state
            .analysis
            .iter()
            .flat_map(|a| a.interesting_facts.iter())
            .map(|f| f.fact.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect()
    }

    /// Text for a prompt; a page that never fetched is an error.
    pub fn require_text(&self) -> Result<&str> {
        self.text().ok_or_else(|| {
            BookGenError::validation(format!("source {} has no text yet", self.url))
        })
    }
}
