//! [`BookGenError`] and the crate-wide [`Result`].
//!
//! One variant per place a run can break. The binary reports them through
//! `color-eyre`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BookGenError {
    /// Bad config file, missing API key, unknown project or setting.
    #[error("config error: {message}")]
    Config { message: String },

    /// Fetch or search failure, including non-2xx responses.
    #[error("network error: {0}")]
    Network(String),

    /// Unreadable page, listing or model JSON.
    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("storage error: {0}")]
    Storage(String),

    /// Provider gave up, or the answer was empty.
    #[error("llm error: {0}")]
    Llm(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A record that cannot be used: a topic without a name, an empty ASIN.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Page HTML that would not turn into Markdown.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// A stage finished without anything to hand to the next one.
    #[error("stage {stage} failed: {message}")]
    Stage { stage: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, BookGenError>;

impl BookGenError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn stage(stage: &'static str, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: msg.into(),
        }
    }

    /// I/O failure on `path`; the path is part of the message.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for BookGenError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("json: {e}"))
    }
}
