//! One section of the planned article: draft, refinement, and the documents
//! that hold them.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use bookgen_markdown::count_words;
use bookgen_shared::{
    BookGenError, Result, Row, Section, SectionKind, TopicRecord, TopicStatus, format_order,
    is_substantive, topic_key,
};
use bookgen_storage::Document;

use crate::context::{ModelRole, StageContext};
use crate::llm::{LlmRequest, LlmTask};
use crate::prompts;
use crate::source::Source;

/// Checkpointed state of a [`Topic`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicState {
    pub status: TopicStatus,
    #[serde(default)]
    pub draft: String,
    #[serde(default)]
    pub refined: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// A planned section. Identity is title + order + name.
#[derive(Debug, Clone)]
pub struct Topic {
    pub record: TopicRecord,
    key: String,
    state: TopicState,
    draft_doc: Document,
    refined_doc: Document,
    loaded: bool,
}

impl Topic {
    pub fn new(ctx: &StageContext<'_>, record: TopicRecord) -> Result<Self> {
        if record.name.trim().is_empty() {
            return Err(BookGenError::validation(format!(
                "topic {} has no name",
                format_order(record.order)
            )));
        }
        // Orders up to the lead-in's band would sort ahead of it; an
        // unreadable order cell arrives here as 0.
        if !record.order.is_finite() || record.order <= SectionKind::Meta.order() {
            return Err(BookGenError::validation(format!(
                "topic '{}' has no usable order ({})",
                record.name, record.order
            )));
        }
        let label = format!("Topic {} {}", format_order(record.order), record.name);
        Ok(Self {
            key: topic_key(&ctx.settings().title, record.order, &record.name),
            draft_doc: ctx.document(&format!("{label} Draft")),
            refined_doc: ctx.document(&format!("{label} Refined")),
            record,
            state: TopicState::default(),
            loaded: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn order(&self) -> f64 {
        self.record.order
    }

    pub fn status(&self) -> TopicStatus {
        self.state.status
    }

    pub fn draft(&self) -> &str {
        &self.state.draft
    }

    pub fn refined(&self) -> &str {
        &self.state.refined
    }

    pub fn draft_document(&self) -> &Document {
        &self.draft_doc
    }

    pub fn refined_document(&self) -> &Document {
        &self.refined_doc
    }

    pub fn has_draft(&self, min_chars: usize) -> bool {
        is_substantive(&self.state.draft, min_chars)
    }

    pub fn has_refined(&self, min_chars: usize) -> bool {
        is_substantive(&self.state.refined, min_chars)
    }

    /// Refined text once it is real content, otherwise the draft.
    pub fn text_or_draft(&self, min_chars: usize) -> &str {
        if self.has_refined(min_chars) {
            &self.state.refined
        } else {
            &self.state.draft
        }
    }

    pub fn section(&self, min_chars: usize) -> Section {
        Section {
            kind: SectionKind::Topic(self.record.order),
            name: self.record.name.clone(),
            text: self.text_or_draft(min_chars).to_string(),
        }
    }

    /// Create the documents and pick up earlier work. Non-trivial document
    /// content wins over the checkpoint: it may have been edited by hand.
    pub async fn initialize(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        self.draft_doc.initialize().await?;
        self.refined_doc.initialize().await?;

        if let Some(state) = ctx.load::<TopicState>(&self.key).await? {
            self.state = state;
        }
        let min_chars = ctx.min_chars();
        let draft = ctx.read_document(&self.draft_doc).await?;
        if is_substantive(&draft, min_chars) {
            self.state.draft = draft;
        }
        let refined = ctx.read_document(&self.refined_doc).await?;
        if is_substantive(&refined, min_chars) {
            self.state.refined = refined;
        }
        if self.has_refined(min_chars) {
            self.state.status = TopicStatus::Refined;
        } else if self.has_draft(min_chars) && self.state.status != TopicStatus::Failed {
            self.state.status = TopicStatus::Drafted;
        }

        debug!(topic = %self.record.name, status = ?self.state.status, "topic initialised");
        self.loaded = true;
        Ok(())
    }

    /// Write the draft unless one exists.
    #[instrument(skip_all, fields(topic = %self.record.name))]
    pub async fn write_draft(
        &mut self,
        ctx: &StageContext<'_>,
        sources: &[Source],
        structure: &[TopicRecord],
    ) -> Result<()> {
        self.initialize(ctx).await?;
        if self.has_draft(ctx.min_chars()) {
            return Ok(());
        }
        let result = self.generate_draft(ctx, sources, structure).await;
        self.settle(ctx, result).await
    }

    async fn generate_draft(
        &mut self,
        ctx: &StageContext<'_>,
        sources: &[Source],
        structure: &[TopicRecord],
    ) -> Result<()> {
        let source_texts: Vec<(String, String)> = sources
            .iter()
            .filter(|s| self.record.sources.iter().any(|url| url == &s.url))
            .filter_map(|s| s.text().map(|t| (s.url.clone(), t.to_string())))
            .collect();

        let request = LlmRequest::new(
            LlmTask::WriteDraft,
            ctx.model(ModelRole::Writing),
            prompts::write_draft(ctx.settings(), &self.record, structure, &source_texts),
        );
        let draft = ctx.llm().execute(&request).await.into_text()?;
        self.require_substantive(ctx, &draft, "draft")?;

        self.draft_doc.update_from_markdown(&draft).await?;
        self.state.draft = draft;
        self.state.status = TopicStatus::Drafted;
        info!(words = count_words(&self.state.draft), "draft written");
        Ok(())
    }

    /// Refine the draft in the context of the whole article, then make a
    /// second pass that only fixes the language. Skipped when refined text
    /// exists.
    #[instrument(skip_all, fields(topic = %self.record.name))]
    pub async fn refine(&mut self, ctx: &StageContext<'_>, article_draft: &str) -> Result<()> {
        self.initialize(ctx).await?;
        let min_chars = ctx.min_chars();
        if self.has_refined(min_chars) {
            return Ok(());
        }
        if !self.has_draft(min_chars) {
            return Err(BookGenError::validation(format!(
                "topic '{}' has no draft to refine",
                self.record.name
            )));
        }
        let result = self.generate_refinement(ctx, article_draft).await;
        self.settle(ctx, result).await
    }

    async fn generate_refinement(&mut self, ctx: &StageContext<'_>, article_draft: &str) -> Result<()> {
        let model = ctx.model(ModelRole::Writing);
        let request = LlmRequest::new(
            LlmTask::RefineTopic,
            model.clone(),
            prompts::refine_topic(ctx.settings(), &self.record, article_draft),
        );
        let refined = ctx.llm().execute(&request).await.into_text()?;
        self.require_substantive(ctx, &refined, "refinement")?;

        let request = LlmRequest::new(
            LlmTask::EnforceLanguage,
            model,
            prompts::enforce_language(ctx.settings(), &self.record, &refined),
        );
        let refined = ctx.llm().execute(&request).await.into_text()?;
        self.require_substantive(ctx, &refined, "language pass")?;

        self.refined_doc.update_from_markdown(&refined).await?;
        self.state.refined = refined;
        self.state.status = TopicStatus::Refined;
        info!(words = count_words(&self.state.refined), "topic refined");
        Ok(())
    }

    fn require_substantive(&self, ctx: &StageContext<'_>, text: &str, what: &str) -> Result<()> {
        if is_substantive(text, ctx.min_chars()) {
            Ok(())
        } else {
            Err(BookGenError::Llm(format!(
                "{what} for topic '{}' came back empty",
                self.record.name
            )))
        }
    }

    /// Record the outcome of a generation step in the checkpoint.
    async fn settle(&mut self, ctx: &StageContext<'_>, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => self.state.error = None,
            Err(e) => {
                self.state.status = TopicStatus::Failed;
                self.state.error = Some(e.to_string());
            }
        }
        ctx.save(&self.key, &self.state).await?;
        result
    }

    /// Row of the `Topic Information` tab.
    pub fn table_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("order".into(), self.record.order.into());
        row.insert("topic_name".into(), self.record.name.clone().into());
        row.insert("topic_notes".into(), self.record.notes.clone().into());
        row.insert("word_count".into(), self.record.word_count.into());
        row.insert("sources".into(), self.record.sources.join(", ").into());
        row.insert("draft_url".into(), self.draft_doc.url().into());
        row.insert("draft_word_count".into(), count_words(&self.state.draft).into());
        row.insert("refined_url".into(), self.refined_doc.url().into());
        row.insert(
            "refined_word_count".into(),
            count_words(&self.state.refined).into(),
        );
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, ScriptedLlm, StaticFetcher, StaticSearch};

    fn record() -> TopicRecord {
        TopicRecord {
            order: 1.0,
            name: "Ecology".into(),
            notes: "Water and sand".into(),
            word_count: 300,
            sources: vec![],
        }
    }

    fn writing_llm() -> ScriptedLlm {
        ScriptedLlm::new()
            .on(LlmTask::WriteDraft, "## Ecology\n\nA draft about water.")
            .on(LlmTask::RefineTopic, "## Ecology\n\nA refined text about water.")
            .on(LlmTask::EnforceLanguage, "## Ecology\n\nA refined text about water, in English.")
    }

    #[tokio::test]
    async fn refined_text_takes_precedence_over_draft() {
        let harness = Harness::new(writing_llm(), StaticFetcher::new(), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);
        let ctx = run.ctx();

        let mut topic = Topic::new(&ctx, record()).unwrap();
        topic.write_draft(&ctx, &[], &[record()]).await.unwrap();
        assert_eq!(topic.text_or_draft(ctx.min_chars()), "## Ecology\n\nA draft about water.");

        topic.refine(&ctx, "whole article").await.unwrap();
        assert_eq!(topic.status(), TopicStatus::Refined);
        assert!(topic.text_or_draft(ctx.min_chars()).ends_with("in English."));
        assert_eq!(harness.llm.calls_for(LlmTask::EnforceLanguage), 1);
    }

    #[tokio::test]
    async fn placeholder_refinement_does_not_count() {
        let harness = Harness::new(writing_llm(), StaticFetcher::new(), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);
        let ctx = run.ctx();

        let mut topic = Topic::new(&ctx, record()).unwrap();
        topic.write_draft(&ctx, &[], &[record()]).await.unwrap();
        topic.refined_document().update_from_markdown("```\nTBD\n```").await.unwrap();

        let mut reopened = Topic::new(&ctx, record()).unwrap();
        reopened.initialize(&ctx).await.unwrap();
        assert!(!reopened.has_refined(ctx.min_chars()));
        assert_eq!(reopened.text_or_draft(ctx.min_chars()), "## Ecology\n\nA draft about water.");
    }

    #[tokio::test]
    async fn hand_edited_draft_wins_over_regeneration() {
        let harness = Harness::new(writing_llm(), StaticFetcher::new(), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);
        let ctx = run.ctx();

        let topic = Topic::new(&ctx, record()).unwrap();
        topic
            .draft_document()
            .update_from_markdown("## Ecology\n\nWritten by an editor.")
            .await
            .unwrap();

        let mut topic = Topic::new(&ctx, record()).unwrap();
        topic.write_draft(&ctx, &[], &[record()]).await.unwrap();
        assert_eq!(topic.draft(), "## Ecology\n\nWritten by an editor.");
        assert_eq!(harness.llm.calls_for(LlmTask::WriteDraft), 0);
    }

    #[tokio::test]
    async fn empty_draft_marks_topic_failed() {
        let harness = Harness::new(
            ScriptedLlm::new().on(LlmTask::WriteDraft, "  "),
            StaticFetcher::new(),
            StaticSearch::new(),
        )
        .await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);
        let ctx = run.ctx();

        let mut topic = Topic::new(&ctx, record()).unwrap();
        assert!(topic.write_draft(&ctx, &[], &[record()]).await.is_err());
        assert_eq!(topic.status(), TopicStatus::Failed);
    }

    #[tokio::test]
    async fn nameless_records_are_rejected() {
        let harness = Harness::new(ScriptedLlm::new(), StaticFetcher::new(), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);

        let nameless = TopicRecord {
            name: " ".into(),
            ..record()
        };
        assert!(Topic::new(&run.ctx(), nameless).is_err());
    }

    #[tokio::test]
    async fn orders_at_or_before_the_lead_in_are_rejected() {
        let harness = Harness::new(ScriptedLlm::new(), StaticFetcher::new(), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);
        let with_order = |order: f64| TopicRecord {
            order,
            ..record()
        };

        for order in [0.0, 0.05, 0.1, -2.0, f64::NAN] {
            assert!(Topic::new(&run.ctx(), with_order(order)).is_err(), "{order}");
        }
        assert!(Topic::new(&run.ctx(), with_order(0.2)).is_ok());
    }
}
