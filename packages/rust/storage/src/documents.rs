//! File-backed document store.
//!
//! Every document is a Markdown file under
//! `<root>/projects/<project>/docs/<name>.md`. Files are plain text on purpose:
//! a person may open and edit a draft between runs, and whatever non-trivial
//! content they leave behind is what the next run picks up.

use std::path::{Path, PathBuf};

use bookgen_shared::{BookGenError, Result, slugify};
use url::Url;

/// Root of the document tree.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Handle for a document of a project. Nothing touches disk until the
    /// handle is used.
    pub fn document(&self, project: &str, name: &str) -> Document {
        let path = self
            .root
            .join("projects")
            .join(slugify(project))
            .join("docs")
            .join(format!("{}.md", slugify(name)));
        Document { path }
    }
}

/// One Markdown document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    path: PathBuf,
}

impl Document {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file (and its directories) if it does not exist yet.
    /// Existing content is left alone.
    pub async fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BookGenError::io(parent, e))?;
        }
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| BookGenError::io(&self.path, e))?
        {
            tokio::fs::write(&self.path, "")
                .await
                .map_err(|e| BookGenError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Current content. A document that was never written reads as empty.
    pub async fn export_as_markdown(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(BookGenError::io(&self.path, e)),
        }
    }

    /// Replace the content.
    pub async fn update_from_markdown(&self, markdown: &str) -> Result<()> {
        self.initialize().await?;
        tokio::fs::write(&self.path, markdown)
            .await
            .map_err(|e| BookGenError::io(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), bytes = markdown.len(), "document updated");
        Ok(())
    }

    /// `file://` URL of the document.
    pub fn url(&self) -> String {
        let absolute = std::path::absolute(&self.path).unwrap_or_else(|_| self.path.clone());
        Url::from_file_path(&absolute)
            .map(String::from)
            .unwrap_or_else(|()| absolute.display().to_string())
    }
}
