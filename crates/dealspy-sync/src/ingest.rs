//! Scrape every enabled source, then enrich and store the listings not seen before.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dealspy_adapters::{run_adapter, AdapterError, DisabledExtractor, FallbackExtractor, PageSource, SourceAdapter};
use dealspy_core::{NewDeal, ScrapedListing, Source};
use dealspy_storage::{retry_with_backoff, BackoffPolicy, DealStore, Upserted};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::alerts::{LogAlerts, OperatorAlerts};
use crate::enrich::{enrich_listing, Categorizer, FixedCategorizer, PassthroughTranslator, Translator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: Source,
    pub message: String,
}

impl SourceFailure {
    pub fn new(source: Source, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScraperStats {
    pub total_deals: usize,
    pub by_source: BTreeMap<Source, usize>,
    pub errors: Vec<SourceFailure>,
    pub fallback_sources: Vec<Source>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreTally {
    pub new_deals: usize,
    pub duplicates: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub stats: ScraperStats,
    #[serde(flatten)]
    pub stored: StoreTally,
}

pub struct IngestPipeline {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    pages: Arc<dyn PageSource>,
    store: Arc<dyn DealStore>,
    fallback: Arc<dyn FallbackExtractor>,
    translator: Arc<dyn Translator>,
    categorizer: Arc<dyn Categorizer>,
    alerts: Arc<dyn OperatorAlerts>,
    backoff: BackoffPolicy,
}

impl IngestPipeline {
    pub fn new(adapters: Vec<Arc<dyn SourceAdapter>>, pages: Arc<dyn PageSource>, store: Arc<dyn DealStore>) -> Self {
        Self {
            adapters,
            pages,
            store,
            fallback: Arc::new(DisabledExtractor),
            translator: Arc::new(PassthroughTranslator),
            categorizer: Arc::new(FixedCategorizer::default()),
            alerts: Arc::new(LogAlerts),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackExtractor>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_enrichment(mut self, translator: Arc<dyn Translator>, categorizer: Arc<dyn Categorizer>) -> Self {
        self.translator = translator;
        self.categorizer = categorizer;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn OperatorAlerts>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Keeps only the adapters for `sources`.
    pub fn only_sources(mut self, sources: &[Source]) -> Self {
        self.adapters.retain(|a| sources.contains(&a.source()));
        self
    }

    pub fn sources(&self) -> Vec<Source> {
        self.adapters.iter().map(|a| a.source()).collect()
    }

    /// Scrapes sources one after another. A source that still fails after its retries
    /// is recorded in `errors` and the remaining sources continue.
    pub async fn scrape_all(&self) -> (Vec<ScrapedListing>, ScraperStats) {
        let started = Instant::now();
        let mut stats = ScraperStats::default();
        let mut listings = Vec::new();

        for adapter in &self.adapters {
            let source = adapter.source();
            let adapter: &dyn SourceAdapter = adapter.as_ref();
            let pages: &dyn PageSource = self.pages.as_ref();
            let fallback: &dyn FallbackExtractor = self.fallback.as_ref();

            let result = retry_with_backoff(&self.backoff, source.as_str(), AdapterError::is_retryable, move |_| {
                run_adapter(adapter, pages, fallback)
            })
            .await;

            match result {
                Ok(outcome) => {
                    let used_fallback = outcome.used_fallback();
                    let found = outcome.into_deals();
                    info!(%source, count = found.len(), used_fallback, "source scraped");
                    stats.by_source.insert(source, found.len());
                    if used_fallback {
                        stats.fallback_sources.push(source);
                    }
                    listings.extend(found);
                }
                Err(err) => {
                    error!(%source, error = %err, "source failed after retries");
                    stats.by_source.insert(source, 0);
                    stats.errors.push(SourceFailure::new(source, err.to_string()));
                }
            }
        }

        stats.total_deals = listings.len();
        stats.duration_ms = duration_ms(started.elapsed());
        (listings, stats)
    }

    /// Dedup check, enrichment and insert, one listing at a time. A failing listing is
    /// counted and the rest continue.
    pub async fn store_listings(&self, listings: Vec<ScrapedListing>) -> StoreTally {
        let mut tally = StoreTally::default();
        for listing in listings {
            let source = listing.source;
            let source_id = listing.source_id.clone();

            match self.store.exists(source, &source_id).await {
                Ok(true) => {
                    tally.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(%source, source_id, error = %err, kind = err.kind(), "dedup check failed");
                    tally.failed += 1;
                    continue;
                }
            }

            let deal = enrich_listing(
                NewDeal::from_listing(listing),
                self.translator.as_ref(),
                self.categorizer.as_ref(),
            )
            .await;

            match self.store.upsert(deal).await {
                Ok(Upserted { inserted: true, .. }) => tally.new_deals += 1,
                Ok(Upserted { inserted: false, .. }) => {
                    debug!(%source, source_id, "listing stored concurrently, counted as duplicate");
                    tally.duplicates += 1;
                }
                Err(err) => {
                    warn!(%source, source_id, error = %err, kind = err.kind(), "deal insert failed");
                    tally.failed += 1;
                }
            }
        }
        tally
    }

    /// One full ingestion run. A dry run only scrapes: nothing is enriched, stored or alerted.
    pub async fn run(&self, dry_run: bool) -> IngestSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, dry_run);
        async {
            let started_at = Utc::now();
            info!(sources = self.adapters.len(), "ingestion started");
            let (listings, stats) = self.scrape_all().await;

            let stored = if dry_run {
                StoreTally::default()
            } else {
                let stored = self.store_listings(listings).await;
                self.alerts.scraper_failures(&stats.errors).await;
                self.alerts.fallback_used(&stats.fallback_sources).await;
                stored
            };

            info!(
                scraped = stats.total_deals,
                new_deals = stored.new_deals,
                duplicates = stored.duplicates,
                failed = stored.failed,
                source_errors = stats.errors.len(),
                "ingestion finished"
            );
            IngestSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                dry_run,
                stats,
                stored,
            }
        }
        .instrument(span)
        .await
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
