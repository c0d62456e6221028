//! A marketplace audiobook listing and whether it is an edition of the book.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use bookgen_crawler::{PageKind, parse_listing, with_country_override};
use bookgen_shared::{ItemStatus, ListingInfo, Result, product_key};

use crate::context::{ModelRole, StageContext};
use crate::llm::{LlmRequest, LlmTask};
use crate::prompts;

/// Checkpointed state of a [`ProductPage`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductState {
    pub status: ItemStatus,
    #[serde(default)]
    pub listing: Option<ListingInfo>,
    /// `None` until a judgement succeeded.
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Judgement {
    #[serde(default)]
    is_correct_product: bool,
}

/// One candidate listing. Identity is the listing URL.
#[derive(Debug, Clone)]
pub struct ProductPage {
    pub url: String,
    key: String,
    state: ProductState,
    loaded: bool,
}

impl ProductPage {
    pub fn new(title: &str, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            key: product_key(title, &url),
            url,
            state: ProductState::default(),
            loaded: false,
        }
    }

    pub fn status(&self) -> ItemStatus {
        self.state.status
    }

    pub fn listing(&self) -> Option<&ListingInfo> {
        self.state.listing.as_ref()
    }

    /// Judged to be an edition of the book. Unjudged or failed pages are not.
    pub fn is_correct(&self) -> bool {
        self.state.is_correct.unwrap_or(false)
    }

    pub async fn load(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        if let Some(state) = ctx.load::<ProductState>(&self.key).await? {
            self.state = state;
        }
        self.loaded = true;
        Ok(())
    }

    /// Fetch and parse the listing, then judge it. A fetch failure is an
    /// error; a failed judgement leaves the page excluded and is retried on
    /// the next run.
    #[instrument(skip_all, fields(url = %self.url))]
    pub async fn run_analysis(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        self.load(ctx).await?;
        if self.state.listing.is_some() && self.state.is_correct.is_some() {
            return Ok(());
        }

        if self.state.listing.is_none() {
            if let Err(e) = self.fetch_listing(ctx).await {
                self.state.status = ItemStatus::Failed;
                self.state.error = Some(e.to_string());
                ctx.save(&self.key, &self.state).await?;
                return Err(e);
            }
        }

        match self.judge(ctx).await {
            Ok(verdict) => {
                self.state.is_correct = Some(verdict);
                self.state.status = ItemStatus::Analyzed;
                self.state.error = None;
                debug!(verdict, "listing judged");
            }
            Err(e) => {
                warn!(error = %e, "edition check failed, excluding listing");
                self.state.status = ItemStatus::Failed;
                self.state.error = Some(e.to_string());
            }
        }
        ctx.save(&self.key, &self.state).await
    }

    async fn fetch_listing(&mut self, ctx: &StageContext<'_>) -> Result<()> {
        let fetch_url = with_country_override(&self.url)?;
        let page = ctx.services.fetcher.fetch(&fetch_url, PageKind::Product).await?;
        let mut listing = parse_listing(&page.html, &self.url)?;
        listing.url = self.url.clone();
        self.state.listing = Some(listing);
        self.state.status = ItemStatus::Fetched;
        ctx.save(&self.key, &self.state).await
    }

    async fn judge(&self, ctx: &StageContext<'_>) -> Result<bool> {
        let Some(listing) = &self.state.listing else {
            return Ok(false);
        };
        let language = listing.language.trim().to_lowercase();
        if !ctx
            .settings()
            .audiobook_languages
            .iter()
            .any(|allowed| allowed == &language)
        {
            debug!(language, "listing language not wanted");
            return Ok(false);
        }

        let request = LlmRequest::new(
            LlmTask::JudgeListing,
            ctx.model(ModelRole::General),
            prompts::judge_listing(ctx.settings(), &self.url, &information(listing)),
        )
        .with_schema(prompts::judge_schema());
        let judgement: Judgement = ctx.llm().execute(&request).await.parse()?;
        Ok(judgement.is_correct_product)
    }
}

/// Listing details as shown to the model.
pub fn information(listing: &ListingInfo) -> Value {
    json!({
        "asin": listing.asin,
        "title": listing.title,
        "is_abridged": listing.abridged,
        "authors": listing.authors,
        "narrators": listing.narrators,
        "summary": listing.summary,
        "duration": listing.duration_minutes,
        "rating": listing.rating,
        "language": listing.language,
        "reviews": listing.reviews,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, ScriptedLlm, StaticFetcher, StaticSearch, listing_html};

    const URL: &str = "https://www.audible.com/pd/Dune-Audiobook/B002V1OF70";

    fn verdict(correct: bool) -> ScriptedLlm {
        ScriptedLlm::new().on(
            LlmTask::JudgeListing,
            json!({"is_correct_product": correct}).to_string(),
        )
    }

    fn fetcher(language: &str) -> StaticFetcher {
        StaticFetcher::new().page(
            URL,
            listing_html("Dune", "Frank Herbert", &["Scott Brick"], language, 120),
        )
    }

    #[tokio::test]
    async fn unwanted_language_is_rejected_without_llm() {
        let harness = Harness::new(verdict(true), fetcher("german"), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);

        let mut page = ProductPage::new("Dune", URL);
        page.run_analysis(&run.ctx()).await.unwrap();
        assert!(!page.is_correct());
        assert_eq!(page.listing().unwrap().asin, "B002V1OF70");
        assert_eq!(harness.llm.call_count(), 0);
    }

    #[tokio::test]
    async fn judgement_is_checkpointed() {
        let harness = Harness::new(verdict(true), fetcher("english"), StaticSearch::new()).await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);

        let mut page = ProductPage::new("Dune", URL);
        page.run_analysis(&run.ctx()).await.unwrap();
        assert!(page.is_correct());
        assert_eq!(page.listing().unwrap().num_ratings, 120);

        let mut again = ProductPage::new("Dune", URL);
        again.run_analysis(&run.ctx()).await.unwrap();
        assert!(again.is_correct());
        assert_eq!(harness.llm.call_count(), 1);
        assert_eq!(harness.fetcher.total_fetches(), 1);
    }

    #[tokio::test]
    async fn failed_judgement_excludes_without_error() {
        let harness = Harness::new(
            ScriptedLlm::new().fail(LlmTask::JudgeListing, "timeout"),
            fetcher("english"),
            StaticSearch::new(),
        )
        .await;
        let project = harness.project("Dune", "Frank Herbert").await;
        let run = harness.run_scope(&project);

        let mut page = ProductPage::new("Dune", URL);
        page.run_analysis(&run.ctx()).await.unwrap();
        assert!(!page.is_correct());
        assert_eq!(page.status(), ItemStatus::Failed);
    }
}
