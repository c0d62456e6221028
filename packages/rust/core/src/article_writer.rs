//! Drafting, refinement and assembly of the final article.

use tracing::{info, instrument, warn};

use bookgen_markdown::{count_words, sanitize_llm_markdown};
use bookgen_shared::{BookGenError, Result, Row, Section, TopicRecord, slugify, sort_sections};

use crate::audible_finder::AudibleFinder;
use crate::context::StageContext;
use crate::facts::FactFinder;
use crate::fanout::fan_out;
use crate::meta::MetaWriter;
use crate::source::Source;
use crate::topic::Topic;
use crate::topic_finder::TOPIC_INFO_TAB;

const STAGE: &str = "article";

/// Collaborators whose sections are injected around the topics.
pub struct Injections<'a> {
    pub facts: &'a FactFinder,
    pub audible: &'a AudibleFinder,
    pub meta: &'a MetaWriter,
    pub sources: &'a [Source],
}

/// What a run of the stage produced.
#[derive(Debug, Clone, Default)]
pub struct ArticleReport {
    pub url: String,
    pub words: usize,
    pub sections: usize,
    pub failed: Vec<(String, String)>,
}

/// Writes every topic, then assembles the article document.
#[derive(Debug)]
pub struct ArticleWriter {
    records: Vec<TopicRecord>,
    topics: Vec<Topic>,
}

impl ArticleWriter {
    pub fn new(records: Vec<TopicRecord>, topics: Vec<Topic>) -> Self {
        Self { records, topics }
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Name of the final article document.
    pub fn document_name(author: &str, title: &str) -> String {
        format!("Article {} {}", slugify(author), slugify(title))
    }

    #[instrument(skip_all, fields(title = %ctx.settings().title))]
    pub async fn run(
        &mut self,
        ctx: &StageContext<'_>,
        injections: &Injections<'_>,
    ) -> Result<ArticleReport> {
        ctx.progress.stage("Writing drafts");
        let mut failed = fan_out(
            STAGE,
            self.topics.iter_mut(),
            None,
            ctx.progress,
            |topic| topic.name().to_string(),
            |topic| async move { topic.initialize(ctx).await },
        )
        .await
        .failed;
        self.save_table(ctx).await?;

        let records = &self.records;
        let sources = injections.sources;
        let drafted = fan_out(
            STAGE,
            self.topics.iter_mut(),
            None,
            ctx.progress,
            |topic| topic.name().to_string(),
            |topic| async move { topic.write_draft(ctx, sources, records).await },
        )
        .await;
        self.save_table(ctx).await?;

        let min_chars = ctx.min_chars();
        if !self.topics.iter().any(|t| t.has_draft(min_chars)) {
            return Err(BookGenError::stage(STAGE, "no topic produced a draft"));
        }

        ctx.progress.stage("Refining topics");
        let article_draft = self.full_draft(min_chars);
        let article_draft = article_draft.as_str();
        let refined = fan_out(
            STAGE,
            self.topics.iter_mut().filter(|t| t.has_draft(min_chars)),
            None,
            ctx.progress,
            |topic| topic.name().to_string(),
            |topic| async move { topic.refine(ctx, article_draft).await },
        )
        .await;
        self.save_table(ctx).await?;

        failed.extend(drafted.failed);
        failed.extend(refined.failed);

        ctx.progress.stage("Assembling article");
        let sections = self.assemble(ctx, injections).await;
        let markdown = sanitize_llm_markdown(
            &sections
                .iter()
                .map(|s| s.text.trim())
                .collect::<Vec<_>>()
                .join("\n\n"),
        );

        let settings = ctx.settings();
        let document = ctx.document(&Self::document_name(&settings.author, &settings.title));
        document.initialize().await?;
        document.update_from_markdown(&markdown).await?;

        let words = count_words(&markdown);
        info!(words, sections = sections.len(), failed = failed.len(), "article written");
        Ok(ArticleReport {
            url: document.url(),
            words,
            sections: sections.len(),
            failed,
        })
    }

    /// Drafts in topic order, as context for the refinement pass.
    fn full_draft(&self, min_chars: usize) -> String {
        let mut topics: Vec<&Topic> = self.topics.iter().filter(|t| t.has_draft(min_chars)).collect();
        topics.sort_by(|a, b| a.order().total_cmp(&b.order()));
        topics
            .iter()
            .map(|t| t.draft().trim())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Topic sections plus the injected ones, sorted. Injected sections are
    /// optional: a failure is logged and the article goes out without it.
    async fn assemble(&self, ctx: &StageContext<'_>, injections: &Injections<'_>) -> Vec<Section> {
        let min_chars = ctx.min_chars();
        let mut sections: Vec<Section> = self
            .topics
            .iter()
            .filter(|t| t.has_draft(min_chars))
            .map(|t| t.section(min_chars))
            .collect();
        sort_sections(&mut sections);
        let topic_sections = sections.clone();

        match injections.facts.key_facts_section(ctx).await {
            Ok(section) => sections.push(section),
            Err(e) => warn!(error = %e, "key facts skipped"),
        }
        match injections.audible.on_audiobook_section(ctx, &topic_sections).await {
            Ok(Some(section)) => sections.push(section),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "audiobook section skipped"),
        }
        match injections
            .facts
            .interesting_facts_section(ctx, injections.sources)
            .await
        {
            Ok(Some(section)) => sections.push(section),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "interesting facts skipped"),
        }

        sort_sections(&mut sections);
        match injections.meta.lead_in_section(ctx, &sections).await {
            Ok(section) => sections.push(section),
            Err(e) => warn!(error = %e, "lead-in skipped"),
        }
        sort_sections(&mut sections);
        sections
    }

    async fn save_table(&self, ctx: &StageContext<'_>) -> Result<()> {
        let rows: Vec<Row> = self.topics.iter().map(Topic::table_row).collect();
        ctx.write_tab(TOPIC_INFO_TAB, &rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmTask;
    use crate::testing::{Harness, ScriptedLlm, StaticFetcher, StaticSearch};

    fn record(order: f64, name: &str) -> TopicRecord {
        TopicRecord {
            order,
            name: name.into(),
            notes: String::new(),
            word_count: 200,
            sources: vec![],
        }
    }

    #[tokio::test]
    async fn sections_are_ordered_and_injections_are_optional() {
        fn name_of(prompt: &str) -> &'static str {
            if prompt.contains("section 2, ") || prompt.contains("section \"Legacy\"") {
                "Legacy"
            } else {
                "Plot"
            }
        }
        let llm = ScriptedLlm::new()
            .on_with(LlmTask::WriteDraft, |request| {
                let name = name_of(&request.prompt);
                crate::llm::LlmResponse::success(format!("## {name}\n\nDraft text about {name}."))
            })
            .on_with(LlmTask::RefineTopic, |request| {
                let name = name_of(&request.prompt);
                crate::llm::LlmResponse::success(format!("## {name}\n\nRefined {name}."))
            })
            .on_with(LlmTask::EnforceLanguage, |request| {
                let name = name_of(&request.prompt);
                crate::llm::LlmResponse::success(format!("```markdown\n## {name}\n\nRefined {name}.\n```"))
            })
            .on(LlmTask::WriteLeadIn, "Sand, spice and prophecy.")
            .fail(LlmTask::ResearchKeyFacts, "search model down");
        let harness = Harness::new(llm, StaticFetcher::new(), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);
        let ctx = run.ctx();

        let records = vec![record(2.0, "Legacy"), record(1.0, "Plot")];
        let topics = records
            .iter()
            .map(|r| Topic::new(&ctx, r.clone()).unwrap())
            .collect();
        let mut writer = ArticleWriter::new(records, topics);
        let (facts, audible, meta) = (FactFinder::new(), AudibleFinder::new(), MetaWriter::new());
        let injections = Injections {
            facts: &facts,
            audible: &audible,
            meta: &meta,
            sources: &[],
        };
        let report = writer.run(&ctx, &injections).await.unwrap();

        let document = ctx.document(&ArticleWriter::document_name("Frank Herbert", "Dune"));
        let article = document.export_as_markdown().await.unwrap();
        let lead = article.find("Sand, spice").unwrap();
        let plot = article.find("## Plot").unwrap();
        let legacy = article.find("## Legacy").unwrap();
        assert!(lead < plot && plot < legacy);
        assert!(!article.contains("```"));
        assert_eq!(report.url, document.url());
        assert_eq!(report.sections, 3);

        let tab = harness
            .services
            .storage
            .read_tab(project.id(), TOPIC_INFO_TAB)
            .await
            .unwrap();
        assert_eq!(tab.len(), 2);
        assert!(bookgen_shared::cell_text(tab[0].get("refined_url")).starts_with("file://"));
    }

    #[tokio::test]
    async fn no_drafts_is_a_stage_error() {
        let harness = Harness::new(
            ScriptedLlm::new().fail(LlmTask::WriteDraft, "quota"),
            StaticFetcher::new(),
            StaticSearch::new(),
        )
        .await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);
        let ctx = run.ctx();

        let records = vec![record(1.0, "Plot")];
        let topics = vec![Topic::new(&ctx, records[0].clone()).unwrap()];
        let mut writer = ArticleWriter::new(records, topics);
        let (facts, audible, meta) = (FactFinder::new(), AudibleFinder::new(), MetaWriter::new());
        let injections = Injections {
            facts: &facts,
            audible: &audible,
            meta: &meta,
            sources: &[],
        };
        let err = writer.run(&ctx, &injections).await.unwrap_err();
        assert!(matches!(err, BookGenError::Stage { stage: "article", .. }));
    }
}
