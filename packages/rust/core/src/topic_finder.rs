//! Topic synthesis: turns the ranked source summaries into an article plan.

use serde::Deserialize;
use tracing::{info, instrument, warn};

use bookgen_shared::{BookGenError, Result, Row, TopicRecord, filter_sources, project_key};

use crate::context::{ModelRole, StageContext};
use crate::llm::{LlmRequest, LlmTask};
use crate::prompts;
use crate::source_finder::{SOURCE_INFO_TAB, summaries_from_rows};
use crate::topic::Topic;

pub const TOPIC_INFO_TAB: &str = "Topic Information";

const STAGE: &str = "topics";

#[derive(Debug, Deserialize)]
struct TopicList {
    #[serde(default)]
    topics: Vec<serde_json::Value>,
}

/// Plans the article and owns its [`Topic`]s.
#[derive(Debug, Default)]
pub struct TopicFinder {
    records: Vec<TopicRecord>,
    topics: Vec<Topic>,
}

impl TopicFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[TopicRecord] {
        &self.records
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn topics_mut(&mut self) -> &mut [Topic] {
        &mut self.topics
    }

    pub fn into_topics(self) -> (Vec<TopicRecord>, Vec<Topic>) {
        (self.records, self.topics)
    }

    /// Reload the plan (checkpoint, then the `Topic Information` tab) or
    /// synthesise it from the `Source Information` tab, then build one
    /// [`Topic`] per usable record.
    #[instrument(skip_all, fields(title = %ctx.settings().title))]
    pub async fn run(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        ctx.progress.stage("Planning topics");
        let key = project_key(&ctx.settings().title, "topics");

        let mut records = ctx.load::<Vec<TopicRecord>>(&key).await?.unwrap_or_default();
        if records.is_empty() {
            records = records_from_rows(&ctx.read_tab(TOPIC_INFO_TAB).await?);
            if !records.is_empty() {
                info!(count = records.len(), "topics restored from tab");
            }
        }
        if records.is_empty() {
            records = self.synthesize(ctx).await?;
        }

        self.topics.clear();
        self.records.clear();
        for record in records {
            match Topic::new(ctx, record.clone()) {
                Ok(topic) => {
                    self.records.push(record);
                    self.topics.push(topic);
                }
                Err(e) => warn!(error = %e, "skipping topic record"),
            }
        }
        if self.topics.is_empty() {
            return Err(BookGenError::stage(STAGE, "no usable topics"));
        }

        ctx.save(&key, &self.records).await?;
        let rows: Vec<Row> = self.topics.iter().map(Topic::table_row).collect();
        ctx.write_tab(TOPIC_INFO_TAB, &rows).await?;
        info!(topics = self.topics.len(), "topic stage complete");
        Ok(())
    }

    async fn synthesize(&self, ctx: &StageContext<'_>) -> Result<Vec<TopicRecord>> {
        let settings = ctx.settings();
        let rows = ctx
            .services
            .storage
            .read_tab(ctx.project_id(), SOURCE_INFO_TAB)
            .await?;
        let sources = filter_sources(
            summaries_from_rows(&rows),
            settings.min_coverage_rating,
            settings.max_sources,
        );
        if sources.is_empty() {
            return Err(BookGenError::stage(
                STAGE,
                format!(
                    "no source reaches a coverage rating of {}",
                    settings.min_coverage_rating
                ),
            ));
        }

        let request = LlmRequest::new(
            LlmTask::SynthesizeTopics,
            ctx.model(ModelRole::Complex),
            prompts::synthesize_topics(settings, &sources),
        )
        .with_schema(prompts::topics_schema());
        let list: TopicList = ctx.llm().execute(&request).await.parse()?;
        let records = parse_records(list.topics);
        info!(sources = sources.len(), topics = records.len(), "topics synthesised");
        Ok(records)
    }
}

fn parse_records(values: Vec<serde_json::Value>) -> Vec<TopicRecord> {
    values
        .into_iter()
        .filter_map(|value| {
            serde_json::from_value::<TopicRecord>(value)
                .map_err(|e| warn!(error = %e, "skipping unreadable topic"))
                .ok()
        })
        .collect()
}

/// Parse the `Topic Information` tab back into records.
pub fn records_from_rows(rows: &[Row]) -> Vec<TopicRecord> {
    parse_records(
        rows.iter()
            .map(|row| serde_json::Value::Object(row.clone()))
            .collect(),
    )
}
