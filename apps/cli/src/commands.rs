//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use bookgen_core::{
    AsinListWorker, BookRequest, BookWorker, CachedLlm, LlmClient, LlmSearch, OpenRouterClient,
    ProgressReporter, ProjectContext, RunOptions, Services, SvgComposer,
};
use bookgen_crawler::Scraper;
use bookgen_discovery::{BraveSearch, WebSearch};
use bookgen_shared::{
    AppConfig, SETTINGS_TAB, SearchProvider, cell_text, init_config, load_config, render_config,
    validate_api_keys,
};
use bookgen_storage::{DocumentStore, Storage};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// bookgen: research a book and write an article about it.
#[derive(Parser)]
#[command(
    name = "bookgen",
    version,
    about = "Research a book on the web and write a resumable, long-form article about it.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Create a project for a book, from title and author or from an ASIN.
    Init {
        #[arg(long, required_unless_present = "asin")]
        title: Option<String>,

        #[arg(long, required_unless_present = "asin")]
        author: Option<String>,

        /// Read title and author from the marketplace listing instead.
        #[arg(long, conflicts_with_all = ["title", "author"])]
        asin: Option<String>,

        #[arg(long, default_value = "en")]
        language: String,

        #[arg(long, default_value = "US")]
        country: String,
    },

    /// Run (or resume) the pipeline for a project.
    Run {
        /// Project name or ID.
        project: String,

        /// Ignore stored results and recompute everything.
        #[arg(long)]
        fresh: bool,

        /// Recompute checkpoints older than this many days (0 keeps them forever).
        #[arg(long)]
        ttl_days: Option<u32>,
    },

    /// Change a project setting.
    Set {
        /// Project name or ID.
        project: String,
        key: String,
        value: String,
    },

    /// Show a project's settings, tabs and checkpoints.
    Show {
        /// Project name or ID.
        project: String,
    },

    /// List all projects.
    List,

    /// Drop stored checkpoints so the next run recomputes them.
    Invalidate {
        /// Project name or ID.
        project: String,

        /// Only drop checkpoints whose key starts with this.
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Work with the ASIN queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Queue subcommands.
#[derive(Subcommand)]
pub(crate) enum QueueAction {
    /// Add a listing to the queue.
    Add {
        asin: String,

        #[arg(long, default_value = "en")]
        language: String,

        #[arg(long, default_value = "US")]
        country: String,
    },
    /// Process open queue rows.
    Run {
        /// Stop after this many rows.
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        fresh: bool,
    },
    /// Print the queue.
    Show,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "bookgen=info",
        1 => "bookgen=debug",
        _ => "bookgen=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init {
            title,
            author,
            asin,
            language,
            country,
        } => cmd_init(title, author, asin, &language, &country).await,
        Command::Run {
            project,
            fresh,
            ttl_days,
        } => cmd_run(&project, fresh, ttl_days).await,
        Command::Set {
            project,
            key,
            value,
        } => cmd_set(&project, &key, &value).await,
        Command::Show { project } => cmd_show(&project).await,
        Command::List => cmd_list().await,
        Command::Invalidate { project, prefix } => cmd_invalidate(&project, prefix.as_deref()).await,
        Command::Queue { action } => match action {
            QueueAction::Add {
                asin,
                language,
                country,
            } => cmd_queue_add(&asin, &language, &country).await,
            QueueAction::Run { limit, fresh } => cmd_queue_run(limit, fresh).await,
            QueueAction::Show => cmd_queue_show().await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = config.database_path()?;
    Ok(Arc::new(Storage::open(&path).await?))
}

/// Build the production collaborators from the app config. A fresh run skips
/// LLM cache reads; the checkpoint TTL also ages out cached responses.
async fn build_services(config: AppConfig, options: &RunOptions) -> Result<Services> {
    let storage = open_storage(&config).await?;
    let documents = DocumentStore::new(config.data_dir()?);

    let api_key = std::env::var(&config.llm.api_key_env).unwrap_or_default();
    let provider: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(
        &config.llm.base_url,
        api_key,
        &config.llm,
    )?);
    let llm: Arc<dyn LlmClient> = if config.llm.cache_responses {
        Arc::new(
            CachedLlm::new(provider, storage.clone())
                .refresh(options.fresh)
                .with_ttl(options.ttl),
        )
    } else {
        provider
    };

    let search: Arc<dyn WebSearch> = match config.search.provider {
        SearchProvider::Brave => {
            let key = std::env::var(&config.search.api_key_env).unwrap_or_default();
            Arc::new(BraveSearch::new(&config.search.endpoint, key)?)
        }
        SearchProvider::Llm => Arc::new(LlmSearch::new(llm.clone(), &config.llm.search_model)),
    };

    Ok(Services {
        fetcher: Arc::new(Scraper::new(&config.scrape)?),
        composer: Arc::new(SvgComposer),
        config,
        storage,
        documents,
        llm,
        search,
    })
}

/// Find a project by exact name, then by ID or ID prefix.
async fn find_project(storage: &Storage, key: &str) -> Result<ProjectContext> {
    if storage.get_project(key).await?.is_some() {
        return Ok(ProjectContext::load(storage, key).await?);
    }
    let matches: Vec<_> = storage
        .list_projects()
        .await?
        .into_iter()
        .filter(|p| p.id.starts_with(key))
        .collect();
    match matches.as_slice() {
        [project] => Ok(ProjectContext::load(storage, &project.name).await?),
        [] => Err(eyre!("no project named or identified by '{key}'")),
        _ => Err(eyre!("'{key}' matches {} projects; use more of the ID", matches.len())),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_init(
    title: Option<String>,
    author: Option<String>,
    asin: Option<String>,
    language: &str,
    country: &str,
) -> Result<()> {
    let config = load_config()?;
    let services = build_services(config, &RunOptions::default()).await?;
    let worker = BookWorker::new(&services);

    let project = match asin {
        Some(asin) => {
            worker
                .init_from_asin(&asin, language, &country.to_uppercase())
                .await?
        }
        None => {
            let request = BookRequest {
                title: title.unwrap_or_default(),
                author: author.unwrap_or_default(),
                language: language.to_string(),
                country: country.to_uppercase(),
                asin: None,
            };
            worker.init(&request).await?
        }
    };

    println!();
    println!("  Project ready.");
    println!("  ID:     {}", project.project.id);
    println!("  Name:   {}", project.project.name);
    println!("  Title:  {}", project.settings.title);
    println!("  Author: {}", project.settings.author);
    println!();
    Ok(())
}

async fn cmd_run(project: &str, fresh: bool, ttl_days: Option<u32>) -> Result<()> {
    let config = load_config()?;
    validate_api_keys(&config)?;

    let options = RunOptions {
        fresh,
        ..RunOptions::with_ttl_days(ttl_days.unwrap_or(config.defaults.ttl_days))
    };
    let services = build_services(config, &options).await?;
    let mut project = find_project(&services.storage, project).await?;
    info!(project = %project.project.name, fresh, "running pipeline");

    let reporter = CliProgress::new();
    let report = BookWorker::new(&services)
        .run(&mut project, options, &reporter)
        .await?;

    println!();
    println!("  Article written!");
    println!("  Sources:    {} analysed, {} failed", report.sources.analysed, report.sources.failed.len());
    println!("  Topics:     {}", report.topics);
    println!("  Audiobooks: {}", report.audiobooks.selected);
    println!("  Words:      {}", report.article.words);
    println!("  Article:    {}", report.article.url);
    if !report.article.failed.is_empty() {
        println!();
        println!("  {} topic step(s) failed; run again to retry them:", report.article.failed.len());
        for (topic, error) in &report.article.failed {
            println!("    {topic}: {error}");
        }
    }
    println!();
    Ok(())
}

async fn cmd_set(project: &str, key: &str, value: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let mut project = find_project(&storage, project).await?;
    project.set(&storage, key, value).await?;
    println!("{key} = {value}");
    Ok(())
}

async fn cmd_show(project: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let project = find_project(&storage, project).await?;

    println!();
    println!("  {} ({})", project.project.name, project.project.id);
    println!("  Updated: {}", project.project.updated_at);
    println!();
    for row in storage.read_tab(project.id(), SETTINGS_TAB).await? {
        println!("  {:<24} {}", cell_text(row.get("Key")), cell_text(row.get("Value")));
    }

    println!();
    println!("  Tabs:");
    for tab in storage.list_tabs(project.id()).await? {
        let rows = storage.read_tab(project.id(), &tab).await?.len();
        println!("    {tab:<24} {rows} rows");
    }

    let keys = storage.list_checkpoint_keys(project.id()).await?;
    println!();
    println!("  Checkpoints: {}", keys.len());
    for key in keys {
        println!("    {key}");
    }
    println!();
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let projects = storage.list_projects().await?;
    if projects.is_empty() {
        println!("No projects yet. Create one with `bookgen init`.");
        return Ok(());
    }
    for project in projects {
        println!("{}  {}  (updated {})", project.id, project.name, project.updated_at);
    }
    Ok(())
}

async fn cmd_invalidate(project: &str, prefix: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let project = find_project(&storage, project).await?;
    let dropped = storage
        .invalidate_prefix(project.id(), prefix.unwrap_or(""))
        .await?;
    info!(project = %project.project.name, dropped, "checkpoints invalidated");
    println!("Dropped {dropped} checkpoint(s).");
    Ok(())
}

async fn cmd_queue_add(asin: &str, language: &str, country: &str) -> Result<()> {
    let config = load_config()?;
    let services = build_services(config, &RunOptions::default()).await?;
    AsinListWorker::new(&services)
        .add(asin, language, &country.to_uppercase())
        .await?;
    println!("Queued {asin}.");
    Ok(())
}

async fn cmd_queue_run(limit: Option<usize>, fresh: bool) -> Result<()> {
    let config = load_config()?;
    validate_api_keys(&config)?;

    let options = RunOptions {
        fresh,
        ..RunOptions::with_ttl_days(config.defaults.ttl_days)
    };
    let services = build_services(config, &options).await?;
    let reporter = CliProgress::new();
    let report = AsinListWorker::new(&services)
        .run(limit, options, &reporter)
        .await?;

    println!();
    println!("  Done:   {}", report.done.len());
    println!("  Failed: {}", report.failed.len());
    for (asin, error) in &report.failed {
        println!("    {asin}: {error}");
    }
    println!();
    Ok(())
}

async fn cmd_queue_show() -> Result<()> {
    let config = load_config()?;
    let services = build_services(config, &RunOptions::default()).await?;
    let rows = AsinListWorker::new(&services).rows().await?;
    if rows.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for row in rows {
        println!(
            "{:<12} {:>3}  {}  {}",
            cell_text(row.get("ASIN")),
            cell_text(row.get("Done")),
            cell_text(row.get("Project")),
            cell_text(row.get("Exception")),
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    println!("{}", render_config(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn stage(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item_finished(&self, stage: &str, finished: usize, total: usize) {
        self.spinner.set_message(format!("{stage} [{finished}/{total}]"));
    }

    fn done(&self, _summary: &str) {
        self.spinner.finish_and_clear();
    }
}
