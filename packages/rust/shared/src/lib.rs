//! Shared types, error model, and configuration for bookgen.
//!
//! This crate is the foundation depended on by all other bookgen crates.
//! It provides:
//! - [`BookGenError`], the unified error type
//! - Domain records ([`SourceSummary`], [`TopicRecord`], [`ListingInfo`], [`Section`])
//! - Configuration ([`AppConfig`]) and per-project [`ProjectSettings`]

pub mod config;
pub mod error;
pub mod settings;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, LlmConfig, MarketplaceConfig, ScrapeConfig, SearchConfig,
    SearchProvider, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, render_config, validate_api_keys,
};
pub use error::{BookGenError, Result};
pub use settings::{ProjectSettings, SETTINGS_TAB, normalize_key, setting_row};
pub use types::{
    cell_text, ItemStatus, ListingInfo, ProjectId, Row, Section, SectionKind, SourceSummary, TopicRecord,
    TopicStatus, filter_sources, format_order, hashed_slug, is_substantive, product_key, project_key, slugify,
    sort_sections, source_key, topic_key, value_to_f64,
};
