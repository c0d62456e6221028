//! Key facts and interesting facts sections.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use bookgen_shared::{ProjectSettings, Result, Section, SectionKind, project_key};

use crate::context::{ModelRole, StageContext};
use crate::llm::{LlmRequest, LlmTask};
use crate::prompts;
use crate::source::Source;

/// Bibliographic facts about the book, as organised by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyFacts {
    #[serde(default)]
    pub first_published: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub temporal_setting: String,
    #[serde(default)]
    pub main_themes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FactList {
    #[serde(default)]
    interesting_facts: Vec<String>,
}

/// Researches facts about the book. Both sections are checkpointed per
/// project.
#[derive(Debug, Default)]
pub struct FactFinder;

impl FactFinder {
    pub fn new() -> Self {
        Self
    }

    /// Key facts as a bullet list, researched by the search model and
    /// organised by the general model.
    #[instrument(skip_all)]
    pub async fn key_facts_section(&self, ctx: &StageContext<'_>) -> Result<Section> {
        let settings = ctx.settings();
        let key = project_key(&settings.title, "key_facts");
        let facts = match ctx.load::<KeyFacts>(&key).await? {
            Some(facts) => facts,
            None => {
                let facts = self.research_key_facts(ctx).await?;
                ctx.save(&key, &facts).await?;
                facts
            }
        };
        Ok(Section {
            kind: SectionKind::KeyFacts,
            name: "Key facts".into(),
            text: render_key_facts(settings, &facts),
        })
    }

    async fn research_key_facts(&self, ctx: &StageContext<'_>) -> Result<KeyFacts> {
        let settings = ctx.settings();
        let research = ctx
            .llm()
            .execute(&LlmRequest::new(
                LlmTask::ResearchKeyFacts,
                ctx.model(ModelRole::Search),
                prompts::research_key_facts(settings),
            ))
            .await
            .into_text()?;
        debug!(chars = research.len(), "key facts researched");

        let request = LlmRequest::new(
            LlmTask::OrganizeKeyFacts,
            ctx.model(ModelRole::General),
            prompts::organize_key_facts(settings, &research),
        )
        .with_schema(prompts::key_facts_schema());
        let facts: KeyFacts = ctx.llm().execute(&request).await.parse()?;
        info!(genres = facts.genres.len(), themes = facts.main_themes.len(), "key facts organised");
        Ok(facts)
    }

    /// Facts pooled from every analysed source, merged by the complex model.
    /// `None` when no source yielded a fact.
    #[instrument(skip_all)]
    pub async fn interesting_facts_section(
        &self,
        ctx: &StageContext<'_>,
        sources: &[Source],
    ) -> Result<Option<Section>> {
        let settings = ctx.settings();
        let key = project_key(&settings.title, "interesting_facts");
        let facts = match ctx.load::<Vec<String>>(&key).await? {
            Some(facts) => facts,
            None => {
                let pool: Vec<String> = sources.iter().flat_map(Source::interesting_facts).collect();
                if pool.is_empty() {
                    debug!("no interesting facts collected");
                    return Ok(None);
                }
                let request = LlmRequest::new(
                    LlmTask::SynthesizeFacts,
                    ctx.model(ModelRole::Complex),
                    prompts::synthesize_facts(settings, &pool),
                )
                .with_schema(prompts::interesting_facts_schema());
                let list: FactList = ctx.llm().execute(&request).await.parse()?;
                let facts: Vec<String> = list
                    .interesting_facts
                    .into_iter()
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect();
                if !facts.is_empty() {
                    ctx.save(&key, &facts).await?;
                }
                info!(pooled = pool.len(), kept = facts.len(), "interesting facts synthesised");
                facts
            }
        };
        if facts.is_empty() {
            return Ok(None);
        }

        let mut text = format!("## Interesting facts about {}\n\n", settings.title);
        for fact in &facts {
            text.push_str("- ");
            text.push_str(fact);
            text.push('\n');
        }
        Ok(Some(Section {
            kind: SectionKind::InterestingFacts,
            name: "Interesting facts".into(),
            text,
        }))
    }
}

/// Bullet table of the key facts. Empty fields are left out.
pub fn render_key_facts(settings: &ProjectSettings, facts: &KeyFacts) -> String {
    let mut out = format!(
        "- **Title**: {}\n- **Author**: {}\n",
        settings.title, settings.author
    );
    let mut line = |label: &str, value: String| {
        if !value.trim().is_empty() {
            out.push_str(&format!("- **{label}**: {}\n", value.trim()));
        }
    };
    line("First published", facts.first_published.clone());
    line("Genres", facts.genres.join(", "));
    line("Temporal setting", facts.temporal_setting.clone());
    line(
        "Themes",
        facts
            .main_themes
            .iter()
            .map(|t| title_case(t))
            .collect::<Vec<_>>()
            .join(", "),
    );
    out
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, ScriptedLlm, StaticFetcher, StaticSearch};
    use serde_json::json;

    fn facts_llm() -> ScriptedLlm {
        ScriptedLlm::new()
            .on(LlmTask::ResearchKeyFacts, "Published 1965 by Chilton. Science fiction.")
            .on(
                LlmTask::OrganizeKeyFacts,
                json!({
                    "first_published": "1965",
                    "genres": ["Science fiction", "Adventure"],
                    "temporal_setting": "",
                    "main_themes": ["ecology", "POWER and religion"]
                })
                .to_string(),
            )
            .on(
                LlmTask::SynthesizeFacts,
                json!({"interesting_facts": ["Rejected by many publishers.", " "]}).to_string(),
            )
    }

    #[test]
    fn key_facts_skip_empty_fields() {
        let settings = ProjectSettings::new("Dune", "Frank Herbert");
        let facts = KeyFacts {
            first_published: "1965".into(),
            genres: vec!["Science fiction".into()],
            temporal_setting: " ".into(),
            main_themes: vec!["power and religion".into()],
        };
        let text = render_key_facts(&settings, &facts);
        assert_eq!(
            text,
            "- **Title**: Dune\n- **Author**: Frank Herbert\n- **First published**: 1965\n\
             - **Genres**: Science fiction\n- **Themes**: Power And Religion\n"
        );
    }

    #[tokio::test]
    async fn key_facts_are_researched_once() {
        let harness = Harness::new(facts_llm(), StaticFetcher::new(), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);
        let finder = FactFinder::new();

        let section = finder.key_facts_section(&run.ctx()).await.unwrap();
        assert_eq!(section.kind, SectionKind::KeyFacts);
        assert!(section.text.contains("- **Themes**: Ecology, Power And Religion"));

        finder.key_facts_section(&run.ctx()).await.unwrap();
        assert_eq!(harness.llm.calls_for(LlmTask::ResearchKeyFacts), 1);
        assert_eq!(harness.llm.calls_for(LlmTask::OrganizeKeyFacts), 1);
        let organize = harness
            .llm
            .requests()
            .into_iter()
            .find(|r| r.task == LlmTask::OrganizeKeyFacts)
            .unwrap();
        assert!(organize.prompt.contains("Published 1965 by Chilton."));
    }

    #[tokio::test]
    async fn no_pooled_facts_means_no_call() {
        let harness = Harness::new(facts_llm(), StaticFetcher::new(), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);

        let section = FactFinder::new()
            .interesting_facts_section(&run.ctx(), &[])
            .await
            .unwrap();
        assert!(section.is_none());
        assert_eq!(harness.llm.call_count(), 0);
    }
}
