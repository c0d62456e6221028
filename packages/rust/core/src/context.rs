//! Run-wide collaborators and the read-only context handed to every stage.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use bookgen_crawler::PageFetcher;
use bookgen_discovery::WebSearch;
use bookgen_shared::{
    AppConfig, BookGenError, ProjectSettings, Result, Row, SETTINGS_TAB, cell_text,
    normalize_key, setting_row,
};
use bookgen_storage::{Document, DocumentStore, ProjectRecord, Storage};

use crate::feature_image::ImageComposer;
use crate::llm::{LlmClient, ScopedLlm};
use crate::progress::ProgressReporter;

/// External collaborators shared by every stage of a run.
#[derive(Clone)]
pub struct Services {
    pub config: AppConfig,
    pub storage: Arc<Storage>,
    pub documents: DocumentStore,
    pub llm: Arc<dyn LlmClient>,
    pub search: Arc<dyn WebSearch>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub composer: Arc<dyn ImageComposer>,
}

/// Per-run switches.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore everything stored by earlier runs (results are still saved).
    pub fresh: bool,
    /// Checkpoints older than this are recomputed. `None` keeps them forever.
    pub ttl: Option<Duration>,
}

impl RunOptions {
    pub fn with_ttl_days(days: u32) -> Self {
        Self {
            fresh: false,
            ttl: (days > 0).then(|| Duration::days(i64::from(days))),
        }
    }
}

/// Which configured model a call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    General,
    Complex,
    Writing,
    Search,
}

// ---------------------------------------------------------------------------
// Project context
// ---------------------------------------------------------------------------

/// A project and its settings, loaded once per run.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub project: ProjectRecord,
    pub settings: ProjectSettings,
}

impl ProjectContext {
    /// Load a project by name. Fails when the project or its required
    /// settings are missing.
    pub async fn load(storage: &Storage, name: &str) -> Result<Self> {
        let project = storage
            .get_project(name)
            .await?
            .ok_or_else(|| BookGenError::config(format!("project '{name}' not found")))?;
        let rows = storage.read_tab(&project.id, SETTINGS_TAB).await?;
        let settings = ProjectSettings::from_rows(&rows)?;
        debug!(project = %project.name, "project context loaded");
        Ok(Self { project, settings })
    }

    pub fn id(&self) -> &str {
        &self.project.id
    }

    /// Write one setting back to the `Settings` tab and reload.
    ///
    /// Keys match case- and whitespace-insensitively; an unknown key is
    /// appended as a new row.
    pub async fn set(&mut self, storage: &Storage, key: &str, value: &str) -> Result<()> {
        let rows = storage.read_tab(&self.project.id, SETTINGS_TAB).await?;
        let wanted = normalize_key(key);
        let existing = rows
            .iter()
            .map(|row| cell_text(row.get("Key")))
            .find(|k| normalize_key(k) == wanted);

        match existing {
            Some(stored_key) => {
                let mut updates = Row::new();
                updates.insert("Value".into(), value.into());
                storage
                    .update_row(&self.project.id, SETTINGS_TAB, "Key", &stored_key, &updates)
                    .await?;
            }
            None => {
                storage
                    .write_tab(&self.project.id, SETTINGS_TAB, &[setting_row(key, value)], false)
                    .await?;
            }
        }

        let rows = storage.read_tab(&self.project.id, SETTINGS_TAB).await?;
        self.settings = ProjectSettings::from_rows(&rows)?;
        storage.touch_project(&self.project.id).await?;
        info!(project = %self.project.name, key, "setting updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stage context
// ---------------------------------------------------------------------------

/// Everything a stage or item may read. Items never mutate it.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub services: &'a Services,
    pub project: &'a ProjectContext,
    pub options: &'a RunOptions,
    /// Caps large fan-outs (sources, product pages).
    pub limit: &'a Semaphore,
    pub progress: &'a dyn ProgressReporter,
}

impl<'a> StageContext<'a> {
    pub fn settings(&self) -> &'a ProjectSettings {
        &self.project.settings
    }

    pub fn project_id(&self) -> &'a str {
        &self.project.project.id
    }

    /// The run's LLM, with requests tagged by this project.
    pub fn llm(&self) -> ScopedLlm<'a> {
        ScopedLlm::new(self.services.llm.as_ref(), self.project_id())
    }

    /// Threshold below which generated text counts as "not generated yet".
    pub fn min_chars(&self) -> usize {
        self.services.config.defaults.min_generated_chars
    }

    /// Per-project model override, else the configured default.
    pub fn model(&self, role: ModelRole) -> String {
        let settings = self.settings();
        let llm = &self.services.config.llm;
        let (project, default) = match role {
            ModelRole::General => (&settings.general_model, &llm.general_model),
            ModelRole::Complex => (&settings.complex_model, &llm.complex_model),
            ModelRole::Writing => (&settings.writing_model, &llm.writing_model),
            ModelRole::Search => (&settings.search_model, &llm.search_model),
        };
        project.clone().unwrap_or_else(|| default.clone())
    }

    /// Load a checkpoint of this project. Always absent on a fresh run.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if self.options.fresh {
            return Ok(None);
        }
        self.services
            .storage
            .load_checkpoint_as(self.project_id(), key, self.options.ttl)
            .await
    }

    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.services
            .storage
            .save_checkpoint(self.project_id(), key, value)
            .await
    }

    /// Rows of a project tab. Always empty on a fresh run.
    pub async fn read_tab(&self, tab: &str) -> Result<Vec<Row>> {
        if self.options.fresh {
            return Ok(Vec::new());
        }
        self.services.storage.read_tab(self.project_id(), tab).await
    }

    /// Replace the rows of a project tab.
    pub async fn write_tab(&self, tab: &str, rows: &[Row]) -> Result<()> {
        self.services
            .storage
            .write_tab(self.project_id(), tab, rows, true)
            .await
    }

    pub fn document(&self, name: &str) -> Document {
        self.services.documents.document(&self.project.project.name, name)
    }

    /// Content of a document as a human may have left it. Always empty on a
    /// fresh run.
    pub async fn read_document(&self, document: &Document) -> Result<String> {
        if self.options.fresh {
            return Ok(String::new());
        }
        document.export_as_markdown().await
    }
}
