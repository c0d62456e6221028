//! Page fetching and marketplace listing extraction.
//!
//! This crate provides:
//! - [`PageFetcher`], the fetch seam, and [`Scraper`], its HTTP implementation
//! - [`listing`], product-page parsing (ld+json, ASIN, country override)

pub mod fetch;
pub mod listing;

pub use fetch::{PageFetcher, PageKind, ScrapedPage, Scraper, compute_hash};
pub use listing::{parse_asin, parse_listing, strip_query, with_country_override};
