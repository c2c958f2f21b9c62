//! Source adapters: structured parsing, normalization and generative fallback extraction.

use std::collections::HashSet;

use async_trait::async_trait;
use dealspy_core::{ScrapedListing, ScraperOutcome, Source};
use dealspy_storage::{FetchError, HttpFetcher, RetryDisposition};
use thiserror::Error;
use tracing::{debug, warn};

pub mod fallback;
pub mod model;
pub mod normalize;
pub mod sources;

pub use fallback::{DisabledExtractor, FallbackExtractor, FallbackRequest, GenerativeExtractor};
pub use model::{AnthropicClient, ModelError, TextModel};
pub use sources::{adapter_for_source, all_adapters, ListingPage, PageLayout, ProfileAdapter, SourceAdapter};

pub const CRATE_NAME: &str = "dealspy-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {0}")]
    Selector(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Fetch(err) => err.disposition() == RetryDisposition::Retryable,
            AdapterError::Selector(_) => false,
        }
    }
}

/// Retrieves the raw body of a listing page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, source: Source, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, source: Source, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_text(source.as_str(), url).await?.body)
    }
}

/// Scrapes every listing page of one source.
///
/// A page whose structured parse is empty is handed to `fallback`; if any page was
/// served by the fallback the whole batch is tagged `Fallback`. Pages with structured
/// results never reach the fallback. Listings repeated across pages are kept once.
pub async fn run_adapter(
    adapter: &dyn SourceAdapter,
    pages: &dyn PageSource,
    fallback: &dyn FallbackExtractor,
) -> Result<ScraperOutcome, AdapterError> {
    let source = adapter.source();
    let mut listings: Vec<ScrapedListing> = Vec::new();
    let mut used_fallback = false;

    for url in adapter.listing_urls() {
        let body = pages.fetch_page(source, &url).await?;
        let parsed = adapter.parse_listing(&ListingPage { url: &url, body: &body })?;
        if !parsed.is_empty() {
            debug!(%source, url, count = parsed.len(), "structured parse");
            listings.extend(parsed);
            continue;
        }

        let extracted = fallback
            .extract(FallbackRequest {
                source,
                country: adapter.country(),
                base_url: adapter.base_url(),
                content: &body,
            })
            .await;
        if extracted.is_empty() {
            debug!(%source, url, "page produced no listings");
        } else {
            warn!(%source, url, count = extracted.len(), "structured parse empty, fallback extraction used");
            used_fallback = true;
            listings.extend(extracted);
        }
    }

    let mut seen = HashSet::new();
    listings.retain(|l| seen.insert(l.source_id.clone()));

    Ok(if used_fallback {
        ScraperOutcome::Fallback(listings)
    } else {
        ScraperOutcome::Structured(listings)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealspy_core::Country;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticPages(HashMap<String, String>);

    #[async_trait]
    impl PageSource for StaticPages {
        async fn fetch_page(&self, _source: Source, url: &str) -> Result<String, FetchError> {
            self.0.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    struct CountingExtractor {
        calls: AtomicUsize,
        returns: usize,
    }

    impl CountingExtractor {
        fn returning(returns: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                returns,
            }
        }
    }

    #[async_trait]
    impl FallbackExtractor for CountingExtractor {
        async fn extract(&self, request: FallbackRequest<'_>) -> Vec<ScrapedListing> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (0..self.returns)
                .map(|i| {
                    ScrapedListing::new(
                        request.source,
                        format!("fb-{i}"),
                        format!("Extracted {i}"),
                        format!("{}/lot/{i}", request.base_url),
                        request.country,
                    )
                })
                .collect()
        }
    }

    fn netbid_pages(body: &str) -> StaticPages {
        StaticPages(HashMap::from([(
            "https://www.netbid.com/en/auctions/".to_string(),
            body.to_string(),
        )]))
    }

    #[tokio::test]
    async fn empty_structured_parse_uses_fallback() {
        let adapter = adapter_for_source(Source::Netbid);
        let pages = netbid_pages("<html><body>new layout</body></html>");
        let fallback = CountingExtractor::returning(2);

        let outcome = run_adapter(&adapter, &pages, &fallback).await.unwrap();
        assert!(outcome.used_fallback());
        assert_eq!(outcome.deals().len(), 2);
        assert_eq!(outcome.deals()[0].country, Country::De);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn structured_results_never_reach_fallback() {
        let adapter = adapter_for_source(Source::Netbid);
        let pages = netbid_pages(r#"<a href="/en/lot/1">Hydraulic press</a>"#);
        let fallback = CountingExtractor::returning(2);

        let outcome = run_adapter(&adapter, &pages, &fallback).await.unwrap();
        assert!(!outcome.used_fallback());
        assert_eq!(outcome.deals().len(), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_fallback_keeps_structured_tag() {
        let adapter = adapter_for_source(Source::Netbid);
        let pages = netbid_pages("<html></html>");
        let outcome = run_adapter(&adapter, &pages, &DisabledExtractor).await.unwrap();
        assert!(!outcome.used_fallback());
        assert!(outcome.deals().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_is_retryable_error() {
        let adapter = adapter_for_source(Source::Eer);
        let pages = StaticPages(HashMap::new());
        let err = run_adapter(&adapter, &pages, &DisabledExtractor).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn listings_repeated_across_pages_are_kept_once() {
        let card = r#"<div class="machine-item"><h2>Laser</h2><a href="/machine/laser/12345">x</a></div>"#;
        let adapter = adapter_for_source(Source::Machineseeker);
        let pages = StaticPages(
            adapter
                .listing_urls()
                .into_iter()
                .map(|u| (u, card.to_string()))
                .collect(),
        );
        let outcome = run_adapter(&adapter, &pages, &DisabledExtractor).await.unwrap();
        assert_eq!(outcome.deals().len(), 1);
        assert_eq!(outcome.deals()[0].source_id, "12345");
    }
}
