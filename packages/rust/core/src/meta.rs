//! Lead-in paragraph that opens the article.

use tracing::{info, instrument};

use bookgen_shared::{BookGenError, Result, Section, SectionKind, is_substantive, project_key};

use crate::context::{ModelRole, StageContext};
use crate::llm::{LlmRequest, LlmTask};
use crate::prompts;

#[derive(Debug, Default)]
pub struct MetaWriter;

impl MetaWriter {
    pub fn new() -> Self {
        Self
    }

    /// Lead-in written from the sections assembled so far. Checkpointed.
    #[instrument(skip_all)]
    pub async fn lead_in_section(
        &self,
        ctx: &StageContext<'_>,
        sections: &[Section],
    ) -> Result<Section> {
        let key = project_key(&ctx.settings().title, "lead_in");
        let text = match ctx.load::<String>(&key).await? {
            Some(text) if is_substantive(&text, ctx.min_chars()) => text,
            _ => {
                let article = sections
                    .iter()
                    .map(|s| s.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let request = LlmRequest::new(
                    LlmTask::WriteLeadIn,
                    ctx.model(ModelRole::Writing),
                    prompts::write_lead_in(ctx.settings(), &article),
                );
                let text = ctx.llm().execute(&request).await.into_text()?;
                let text = text.trim().to_string();
                if !is_substantive(&text, ctx.min_chars()) {
                    return Err(BookGenError::Llm("lead-in came back empty".into()));
                }
                ctx.save(&key, &text).await?;
                info!(chars = text.len(), "lead-in written");
                text
            }
        };
        Ok(Section {
            kind: SectionKind::Meta,
            name: "Lead-in".into(),
            text,
        })
    }
}
