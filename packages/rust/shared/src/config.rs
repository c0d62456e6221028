//! Application configuration for bookgen.
//!
//! User config lives at `~/.bookgen/bookgen.toml`.
//! CLI flags override config file values, which override defaults.
//! Per-book settings live in the project's `Settings` tab instead
//! (see [`crate::settings`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BookGenError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "bookgen.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".bookgen";

// ---------------------------------------------------------------------------
// Config structs (matching bookgen.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Page scraping policy.
    #[serde(default)]
    pub scrape: ScrapeConfig,

    /// Web search provider.
    #[serde(default)]
    pub search: SearchConfig,

    /// Audiobook marketplace.
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root for the database and the document tree.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Checkpoints older than this are discarded on load.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,

    /// In-flight cap for large fan-out batches (sources, product pages).
    #[serde(default = "default_fanout_concurrency")]
    pub fanout_concurrency: usize,

    /// Generated text with fewer non-whitespace characters than this counts
    /// as "not generated yet".
    #[serde(default = "default_min_generated_chars")]
    pub min_generated_chars: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ttl_days: default_ttl_days(),
            fanout_concurrency: default_fanout_concurrency(),
            min_generated_chars: default_min_generated_chars(),
        }
    }
}

fn default_data_dir() -> String {
    "~/bookgen-data".into()
}
fn default_ttl_days() -> u32 {
    7
}
fn default_fanout_concurrency() -> usize {
    40
}
fn default_min_generated_chars() -> usize {
    10
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions base URL.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    /// Model for short structured tasks (classification, JSON shaping).
    #[serde(default = "default_general_model")]
    pub general_model: String,

    /// Model for synthesis over many sources.
    #[serde(default = "default_complex_model")]
    pub complex_model: String,

    /// Model for drafting and refining prose.
    #[serde(default = "default_writing_model")]
    pub writing_model: String,

    /// Model with web access, used for LLM-backed search and fact lookup.
    #[serde(default = "default_search_model")]
    pub search_model: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Cache successful responses in the database.
    #[serde(default = "default_true")]
    pub cache_responses: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key_env: default_llm_api_key_env(),
            general_model: default_general_model(),
            complex_model: default_complex_model(),
            writing_model: default_writing_model(),
            search_model: default_search_model(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            max_output_tokens: default_max_output_tokens(),
            cache_responses: true,
        }
    }
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_llm_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_general_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_complex_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_writing_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_search_model() -> String {
    "perplexity/sonar".into()
}
fn default_llm_timeout() -> u64 {
    180
}
fn default_llm_retries() -> u32 {
    3
}
fn default_max_output_tokens() -> u32 {
    8000
}
fn default_true() -> bool {
    true
}

/// `[scrape]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default = "default_scrape_timeout")]
    pub timeout_secs: u64,

    /// Retries for ordinary source pages.
    #[serde(default = "default_scrape_retries")]
    pub max_retries: u32,

    /// Retries for marketplace product pages, which throttle more often.
    #[serde(default = "default_product_retries")]
    pub product_max_retries: u32,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_scrape_timeout(),
            max_retries: default_scrape_retries(),
            product_max_retries: default_product_retries(),
        }
    }
}

fn default_scrape_timeout() -> u64 {
    15
}
fn default_scrape_retries() -> u32 {
    2
}
fn default_product_retries() -> u32 {
    4
}

/// Which search backend finds source URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProvider {
    /// Brave Search web API.
    Brave,
    /// Ask the search model and collect its citations.
    Llm,
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_provider")]
    pub provider: SearchProvider,

    #[serde(default = "default_search_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            api_key_env: default_search_api_key_env(),
            endpoint: default_search_endpoint(),
        }
    }
}

fn default_search_provider() -> SearchProvider {
    SearchProvider::Brave
}
fn default_search_api_key_env() -> String {
    "BRAVE_API_KEY".into()
}
fn default_search_endpoint() -> String {
    "https://api.search.brave.com/res/v1/web/search".into()
}

/// `[marketplace]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    #[serde(default = "default_marketplace_url")]
    pub base_url: String,

    /// Results requested per marketplace search page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            base_url: default_marketplace_url(),
            page_size: default_page_size(),
        }
    }
}

fn default_marketplace_url() -> String {
    "https://www.audible.com".into()
}
fn default_page_size() -> u32 {
    50
}

impl AppConfig {
    /// The data directory with a leading `~` expanded.
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.defaults.data_dir)
    }

    /// Path of the libSQL database inside the data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("bookgen.db"))
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| BookGenError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None if path == "~" => {
            dirs::home_dir().ok_or_else(|| BookGenError::config("could not determine home directory"))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.bookgen/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| BookGenError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.bookgen/bookgen.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BookGenError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| BookGenError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| BookGenError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = render_config(&AppConfig::default())?;

    std::fs::write(&path, content).map_err(|e| BookGenError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Serialize a config the way `init_config` writes it.
pub fn render_config(config: &AppConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| BookGenError::config(e.to_string()))
}

/// Check that every credential the configured providers need is present.
///
/// Runs before any stage so a missing key fails fast instead of halfway
/// through a batch.
pub fn validate_api_keys(config: &AppConfig) -> Result<()> {
    require_env(&config.llm.api_key_env, "LLM", "https://openrouter.ai/keys")?;
    if config.search.provider == SearchProvider::Brave {
        require_env(
            &config.search.api_key_env,
            "Brave Search",
            "https://api.search.brave.com/app/keys",
        )?;
    }
    Ok(())
}

fn require_env(var_name: &str, what: &str, where_to_get: &str) -> Result<()> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(BookGenError::config(format!(
            "{what} API key not found. Set the {var_name} environment variable.\n\
             Get a key at {where_to_get}"
        ))),
    }
}
