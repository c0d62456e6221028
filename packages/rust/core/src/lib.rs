//! Book article pipeline.
//!
//! A project moves through four stages, each resumable from what earlier
//! runs stored: [`SourceFinder`] collects and rates web sources,
//! [`TopicFinder`] turns them into an article outline, [`AudibleFinder`]
//! looks up audiobook editions, and [`ArticleWriter`] drafts, refines and
//! assembles the article. [`BookGenerator`] runs them in order.

pub mod article_writer;
pub mod audible_finder;
pub mod context;
pub mod facts;
pub mod fanout;
pub mod feature_image;
pub mod generator;
pub mod llm;
pub mod meta;
pub mod product_page;
pub mod progress;
pub mod prompts;
pub mod source;
pub mod source_finder;
pub mod topic;
pub mod topic_finder;
pub mod worker;

#[cfg(test)]
pub mod testing;

pub use article_writer::{ArticleReport, ArticleWriter, Injections};
pub use audible_finder::{AudibleFinder, AudibleReport};
pub use context::{ModelRole, ProjectContext, RunOptions, Services, StageContext};
pub use facts::FactFinder;
pub use feature_image::{ImageComposer, SvgComposer};
pub use generator::{BookGenerator, FINAL_ARTICLE_SETTING, RunReport};
pub use llm::{CachedLlm, LlmClient, LlmSearch, LlmTask, OpenRouterClient, ScopedLlm};
pub use meta::MetaWriter;
pub use progress::{ProgressReporter, SilentProgress};
pub use source_finder::{SourceFinder, SourceReport};
pub use topic_finder::TopicFinder;
pub use worker::{AsinListWorker, BookRequest, BookWorker, QUEUE_TAB, QueueReport};
