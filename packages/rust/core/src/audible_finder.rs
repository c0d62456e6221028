//! Audiobook editions of the book: discovery, judging, ranking, the
//! "as an audiobook" section and the feature image.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use bookgen_crawler::PageKind;
use bookgen_discovery::marketplace::{product_links, search_url};
use bookgen_shared::{ListingInfo, Result, Section, SectionKind, project_key, slugify};

use crate::context::{ModelRole, StageContext};
use crate::fanout::fan_out;
use crate::feature_image::cover_sets;
use crate::llm::{LlmRequest, LlmTask};
use crate::product_page::{ProductPage, information};
use crate::prompts;

const STAGE: &str = "audiobooks";

#[derive(Debug, Deserialize)]
struct Descriptions {
    #[serde(default)]
    audible_products: Vec<Description>,
}

#[derive(Debug, Deserialize)]
struct Description {
    #[serde(default)]
    asin: String,
    #[serde(default)]
    description: String,
}

/// What a run of the stage produced.
#[derive(Debug, Clone, Default)]
pub struct AudibleReport {
    pub candidates: usize,
    pub failed: Vec<(String, String)>,
    pub selected: usize,
    pub images: usize,
}

/// Finds and ranks audiobook listings of the book.
#[derive(Debug, Default)]
pub struct AudibleFinder {
    urls: Vec<String>,
    pages: Vec<ProductPage>,
    selected: Vec<ListingInfo>,
}

impl AudibleFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Correct, de-duplicated listings, most rated first.
    pub fn selected(&self) -> &[ListingInfo] {
        &self.selected
    }

    #[instrument(skip_all, fields(title = %ctx.settings().title))]
    pub async fn run(&mut self, ctx: &StageContext<'_>) -> Result<AudibleReport> {
        ctx.progress.stage("Finding audiobooks");
        self.urls = self.find_urls(ctx).await?;

        let title = &ctx.settings().title;
        self.pages = self.urls.iter().map(|url| ProductPage::new(title, url.clone())).collect();
        let report = fan_out(
            STAGE,
            self.pages.iter_mut(),
            Some(ctx.limit),
            ctx.progress,
            |page| page.url.clone(),
            |page| async move { page.run_analysis(ctx).await },
        )
        .await;

        let correct = self
            .pages
            .iter()
            .filter(|page| page.is_correct())
            .filter_map(|page| page.listing().cloned())
            .collect();
        self.selected = select_listings(correct);

        let images = match self.save_feature_images(ctx).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "feature image failed");
                0
            }
        };

        info!(
            candidates = self.pages.len(),
            failed = report.failed.len(),
            selected = self.selected.len(),
            images,
            "audiobook stage complete"
        );
        Ok(AudibleReport {
            candidates: self.pages.len(),
            failed: report.failed,
            selected: self.selected.len(),
            images,
        })
    }

    /// Listing URLs from the marketplace search page, checkpointed once
    /// the page yields any.
    async fn find_urls(&self, ctx: &StageContext<'_>) -> Result<Vec<String>> {
        let settings = ctx.settings();
        let key = project_key(&settings.title, "audible_urls");
        if let Some(urls) = ctx.load::<Vec<String>>(&key).await? {
            return Ok(urls);
        }

        let marketplace = &ctx.services.config.marketplace;
        let url = search_url(
            &marketplace.base_url,
            &settings.title,
            &settings.author,
            marketplace.page_size,
        )?;
        let page = ctx.services.fetcher.fetch(&url, PageKind::Product).await?;
        let urls = product_links(&page.html, &marketplace.base_url);
        if urls.is_empty() {
            warn!(url = %url, "marketplace search found no listings");
            return Ok(urls);
        }
        info!(count = urls.len(), "marketplace listings found");
        ctx.save(&key, &urls).await?;
        Ok(urls)
    }

    /// One composition per rotation of the top covers.
    async fn save_feature_images(&self, ctx: &StageContext<'_>) -> Result<usize> {
        let covers: Vec<String> = self
            .selected
            .iter()
            .filter_map(|listing| listing.image_url.clone())
            .collect();
        let sets = cover_sets(&covers);
        if sets.is_empty() {
            return Ok(0);
        }

        let settings = ctx.settings();
        let stem: String = slugify(&format!("{}-{}", settings.author, settings.title))
            .chars()
            .take(100)
            .collect();
        let dir = ctx.services.config.data_dir()?.join("images");
        for (i, set) in sets.iter().enumerate() {
            let output = dir.join(format!("{stem} ({i}).svg"));
            ctx.services.composer.compose(set, &output).await?;
        }
        debug!(count = sets.len(), "feature images written");
        Ok(sets.len())
    }

    /// The "as an audiobook" section, checkpointed. `None` when no edition
    /// was found.
    #[instrument(skip_all)]
    pub async fn on_audiobook_section(
        &self,
        ctx: &StageContext<'_>,
        sections: &[Section],
    ) -> Result<Option<Section>> {
        let settings = ctx.settings();
        let key = project_key(&settings.title, "on_audiobook");
        if let Some(text) = ctx.load::<String>(&key).await? {
            return Ok(Some(audiobook_section(text)));
        }
        if self.selected.is_empty() {
            debug!("no audiobook editions to describe");
            return Ok(None);
        }

        let listings: Vec<&ListingInfo> =
            self.selected.iter().take(settings.max_audiobooks).collect();
        let products = Value::Array(listings.iter().map(|l| information(l)).collect());
        let article = sections
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let request = LlmRequest::new(
            LlmTask::DescribeAudiobooks,
            ctx.model(ModelRole::General),
            prompts::describe_audiobooks(settings, &products, &article),
        )
        .with_schema(prompts::descriptions_schema());
        let descriptions: Descriptions = ctx.llm().execute(&request).await.parse()?;

        let text = render_audiobooks(&settings.title, &listings, &descriptions.audible_products);
        ctx.save(&key, &text).await?;
        Ok(Some(audiobook_section(text)))
    }
}

fn audiobook_section(text: String) -> Section {
    Section {
        kind: SectionKind::OnAudiobook,
        name: "Audiobook".into(),
        text,
    }
}

/// Sort by rating count (descending, stable) and keep the first listing of
/// every title/author/narrators/abridged group.
pub fn select_listings(mut listings: Vec<ListingInfo>) -> Vec<ListingInfo> {
    listings.sort_by(|a, b| b.num_ratings.cmp(&a.num_ratings));
    let mut seen = HashSet::new();
    listings.retain(|listing| seen.insert(listing.dedup_key()));
    listings
}

/// Descriptions whose ASIN matches no listing are dropped.
fn render_audiobooks(title: &str, listings: &[&ListingInfo], descriptions: &[Description]) -> String {
    let mut out = format!("## {title} as an audiobook\n\n");
    for description in descriptions {
        let Some(listing) = listings.iter().find(|l| l.asin == description.asin.trim()) else {
            warn!(asin = %description.asin, "description for unknown listing");
            continue;
        };
        let abridged = if listing.abridged { " (abridged)" } else { "" };
        out.push_str(&format!("- **[{}]({})**{abridged}\n", listing.title, listing.url));
        if !listing.language.is_empty() {
            out.push_str(&format!("- **Language**: {}\n", capitalize(&listing.language)));
        }
        if !listing.narrators.is_empty() {
            out.push_str(&format!("- **Narrator**: {}\n", listing.narrators.join(", ")));
        }
        if let Some(duration) = listing.say_duration() {
            out.push_str(&format!("- **Duration**: {duration}\n"));
        }
        if let Some(rating) = listing.rating {
            out.push_str(&format!(
                "- **Rating**: {rating:.1} ({} ratings)\n",
                listing.num_ratings
            ));
        }
        out.push_str(&format!("\n{}\n\n", description.description.trim()));
    }
    out
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
