//! Per-project settings, stored as `{Key, Value}` rows in the project's
//! `Settings` tab so they can be edited by hand between runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BookGenError, Result};
use crate::types::{Row, cell_text, value_to_f64};

/// Name of the settings tab.
pub const SETTINGS_TAB: &str = "Settings";

/// Column holding the setting name.
pub const KEY_COLUMN: &str = "Key";

/// Column holding the setting value.
pub const VALUE_COLUMN: &str = "Value";

/// Resolved settings for one book project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub title: String,
    pub author: String,
    pub language: String,
    pub country: String,
    pub asin: Option<String>,
    pub proposed_word_count: u32,
    pub min_source_length: usize,
    pub urls_per_search: usize,
    pub num_search_refinements: usize,
    pub max_sources: usize,
    pub min_coverage_rating: f64,
    pub audiobook_languages: Vec<String>,
    pub max_audiobooks: usize,
    pub general_model: Option<String>,
    pub complex_model: Option<String>,
    pub writing_model: Option<String>,
    pub search_model: Option<String>,
    pub final_article: Option<String>,
}

impl ProjectSettings {
    /// Settings for a new project with every optional value at its default.
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            language: "en".into(),
            country: "US".into(),
            asin: None,
            proposed_word_count: 2000,
            min_source_length: 2000,
            urls_per_search: 7,
            num_search_refinements: 7,
            max_sources: 80,
            min_coverage_rating: 7.0,
            audiobook_languages: vec!["english".into()],
            max_audiobooks: 5,
            general_model: None,
            complex_model: None,
            writing_model: None,
            search_model: None,
            final_article: None,
        }
    }

    /// Build settings from the rows of the `Settings` tab.
    ///
    /// `title` and `author` are required; unknown keys are ignored.
    pub fn from_rows(rows: &[Row]) -> Result<Self> {
        let values = settings_map(rows);
        let required = |key: &str| {
            values
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| BookGenError::config(format!("project setting '{key}' is missing")))
        };

        let mut settings = Self::new(required("title")?, required("author")?);
        let text = |key: &str| values.get(key).filter(|v| !v.is_empty()).cloned();
        let number = |key: &str, fallback: f64| {
            values
                .get(key)
                .filter(|v| !v.is_empty())
                .map(|v| value_to_f64(&Value::String(v.clone())))
                .filter(|n| *n > 0.0)
                .unwrap_or(fallback)
        };

        if let Some(language) = text("language") {
            settings.language = language;
        }
        if let Some(country) = text("country") {
            settings.country = country.to_uppercase();
        }
        settings.asin = text("asin");
        settings.proposed_word_count =
            number("proposed_word_count", f64::from(settings.proposed_word_count)) as u32;
        settings.min_source_length =
            number("min_source_length", settings.min_source_length as f64) as usize;
        settings.urls_per_search = number("urls_per_search", settings.urls_per_search as f64) as usize;
        settings.num_search_refinements =
            number("num_search_refinements", settings.num_search_refinements as f64) as usize;
        settings.max_sources = number("max_sources", settings.max_sources as f64) as usize;
        settings.min_coverage_rating = number("min_coverage_rating", settings.min_coverage_rating);
        settings.max_audiobooks = number("max_audiobooks", settings.max_audiobooks as f64) as usize;
        if let Some(languages) = text("audiobook_languages") {
            settings.audiobook_languages = languages
                .split([',', ';'])
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect();
        }
        settings.general_model = text("general_model");
        settings.complex_model = text("complex_model");
        settings.writing_model = text("writing_model");
        settings.search_model = text("search_model");
        settings.final_article = text("final_article");

        Ok(settings)
    }

    /// Rows for a freshly created `Settings` tab.
    pub fn to_rows(&self) -> Vec<Row> {
        let mut pairs: Vec<(&str, String)> = vec![
            ("Title", self.title.clone()),
            ("Author", self.author.clone()),
            ("Language", self.language.clone()),
            ("Country", self.country.clone()),
            ("Proposed Word Count", self.proposed_word_count.to_string()),
            ("Min Source Length", self.min_source_length.to_string()),
            ("URLs Per Search", self.urls_per_search.to_string()),
            ("Num Search Refinements", self.num_search_refinements.to_string()),
            ("Max Sources", self.max_sources.to_string()),
            ("Min Coverage Rating", self.min_coverage_rating.to_string()),
            ("Audiobook Languages", self.audiobook_languages.join("; ")),
            ("Max Audiobooks", self.max_audiobooks.to_string()),
        ];
        if let Some(asin) = &self.asin {
            pairs.push(("ASIN", asin.clone()));
        }
        pairs.into_iter().map(|(k, v)| setting_row(k, &v)).collect()
    }
}

/// `"Min Coverage Rating "` → `"min_coverage_rating"`.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join("_")
}

/// A `{Key, Value}` row.
pub fn setting_row(key: &str, value: &str) -> Row {
    let mut row = Row::new();
    row.insert(KEY_COLUMN.into(), Value::String(key.into()));
    row.insert(VALUE_COLUMN.into(), Value::String(value.into()));
    row
}

fn settings_map(rows: &[Row]) -> HashMap<String, String> {
    rows.iter()
        .filter_map(|row| {
            let key = row.get(KEY_COLUMN)?.as_str()?;
            Some((normalize_key(key), cell_text(row.get(VALUE_COLUMN))))
        })
        .collect()
}
