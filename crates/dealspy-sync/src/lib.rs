//! Job orchestration: configuration, enrichment, ingestion, notification fan-out and
//! the daily digest, wired together at one composition root.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dealspy_adapters::{
    AnthropicClient, DisabledExtractor, FallbackExtractor, GenerativeExtractor, SourceAdapter, TextModel,
};
use dealspy_core::Source;
use dealspy_notify::{ChannelSender, Dispatcher, Mailer, OneSignalSender, ResendMailer, TelegramSender};
use dealspy_storage::{BackoffPolicy, DealStore, HttpClientConfig, HttpFetcher, MemoryStore, PgStore};
use tokio::sync::OnceCell;
use tracing::info;

pub mod alerts;
pub mod config;
pub mod digest_job;
pub mod enrich;
pub mod ingest;
pub mod notify_job;

pub use alerts::{LogAlerts, MailAlerts, OperatorAlerts};
pub use config::{ConfigError, SourceEntry, SourceRegistry, SyncConfig};
pub use digest_job::{DigestJob, DigestSummary};
pub use enrich::{enrich_listing, Categorizer, ModelCategorizer, ModelTranslator, Translator};
pub use ingest::{IngestPipeline, IngestSummary, ScraperStats, SourceFailure, StoreTally};
pub use notify_job::{NotifyJob, NotifySummary};

pub const CRATE_NAME: &str = "dealspy-sync";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// The three externally triggered jobs.
#[async_trait]
pub trait CronJobs: Send + Sync {
    async fn scrape(&self, dry_run: bool) -> Result<IngestSummary>;
    async fn notify(&self) -> Result<NotifySummary>;
    async fn digest(&self) -> Result<DigestSummary>;
}

/// Owns every provider client; each is built once and shared by the jobs.
pub struct Runtime {
    config: SyncConfig,
    fetcher: Arc<HttpFetcher>,
    store: OnceCell<Arc<PgStore>>,
}

impl Runtime {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
        })?;
        Ok(Self {
            config,
            fetcher: Arc::new(fetcher),
            store: OnceCell::new(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(SyncConfig::from_env()?)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn http(&self) -> reqwest::Client {
        self.fetcher.client().clone()
    }

    /// Connects on first use.
    pub async fn store(&self) -> Result<Arc<PgStore>> {
        let store = self
            .store
            .get_or_try_init(|| async {
                PgStore::connect(&self.config.database_url)
                    .await
                    .map(Arc::new)
                    .context("connecting to postgres")
            })
            .await?;
        Ok(store.clone())
    }

    pub async fn migrate(&self) -> Result<()> {
        self.store().await?.migrate().await.context("applying migrations")
    }

    /// The registry file when present, otherwise every source with built-in pages.
    pub async fn registry(&self) -> Result<SourceRegistry> {
        let path = self.config.sources_path();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Ok(SourceRegistry::load(&path).await?)
        } else {
            info!(path = %path.display(), "no source registry, using built-in sources");
            Ok(SourceRegistry::builtin())
        }
    }

    pub fn text_model(&self) -> Option<Arc<dyn TextModel>> {
        let key = self.config.anthropic_api_key.as_ref()?;
        Some(Arc::new(AnthropicClient::new(
            self.http(),
            key.clone(),
            self.config.anthropic_model.clone(),
        )))
    }

    pub fn mailer(&self) -> Option<Arc<dyn Mailer>> {
        let key = self.config.resend_api_key.as_ref()?;
        Some(Arc::new(ResendMailer::new(
            self.http(),
            key.clone(),
            self.config.from_email.clone(),
        )))
    }

    /// Senders for the configured push and Telegram providers only.
    pub fn senders(&self) -> Vec<Arc<dyn ChannelSender>> {
        let mut senders: Vec<Arc<dyn ChannelSender>> = Vec::new();
        if let Some(onesignal) = &self.config.onesignal {
            senders.push(Arc::new(OneSignalSender::new(
                self.http(),
                onesignal.app_id.clone(),
                onesignal.api_key.clone(),
            )));
        }
        if let Some(token) = &self.config.telegram_bot_token {
            senders.push(Arc::new(TelegramSender::new(self.http(), token.clone())));
        }
        senders
    }

    fn alerts(&self) -> Arc<dyn OperatorAlerts> {
        match (self.mailer(), &self.config.admin_email) {
            (Some(mailer), Some(admin)) => Arc::new(MailAlerts::new(mailer, admin.clone())),
            _ => Arc::new(LogAlerts),
        }
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.config.scrape_retries,
            base_delay: self.config.retry_base,
            max_delay: MAX_RETRY_DELAY,
        }
    }

    /// A dry run gets a throwaway in-memory store so nothing touches the database.
    pub async fn ingest_pipeline(&self, dry_run: bool) -> Result<IngestPipeline> {
        let adapters: Vec<Arc<dyn SourceAdapter>> = self
            .registry()
            .await?
            .adapters()?
            .into_iter()
            .map(|a| Arc::new(a) as Arc<dyn SourceAdapter>)
            .collect();
        let store: Arc<dyn DealStore> = if dry_run {
            Arc::new(MemoryStore::new())
        } else {
            self.store().await?
        };

        let model = self.text_model();
        let fallback: Arc<dyn FallbackExtractor> = match &model {
            Some(model) if self.config.ai_fallback_enabled => {
                Arc::new(GenerativeExtractor::new(model.clone(), enrich::DEFAULT_MODEL_TIMEOUT))
            }
            _ => Arc::new(DisabledExtractor),
        };

        let mut pipeline = IngestPipeline::new(adapters, self.fetcher.clone(), store)
            .with_fallback(fallback)
            .with_alerts(self.alerts())
            .with_backoff(self.backoff());
        if let Some(model) = model {
            pipeline = pipeline.with_enrichment(
                Arc::new(ModelTranslator::new(model.clone(), enrich::DEFAULT_MODEL_TIMEOUT)),
                Arc::new(ModelCategorizer::new(model, enrich::DEFAULT_MODEL_TIMEOUT)),
            );
        }
        Ok(pipeline)
    }

    pub async fn scrape_sources(&self, dry_run: bool, only: &[Source]) -> Result<IngestSummary> {
        let mut pipeline = self.ingest_pipeline(dry_run).await?;
        if !only.is_empty() {
            pipeline = pipeline.only_sources(only);
        }
        Ok(pipeline.run(dry_run).await)
    }

    pub async fn notify_job(&self) -> Result<NotifyJob> {
        let store = self.store().await?;
        let dispatcher = Dispatcher::new(self.senders()).with_concurrency(self.config.notify_concurrency);
        Ok(NotifyJob::new(store.clone(), store, dispatcher))
    }

    pub async fn digest_job(&self) -> Result<DigestJob> {
        let Some(mailer) = self.mailer() else {
            bail!("RESEND_API_KEY is not configured, digest cannot be sent");
        };
        let store = self.store().await?;
        Ok(DigestJob::new(store.clone(), store, mailer, self.config.app_url.clone()))
    }
}

#[async_trait]
impl CronJobs for Runtime {
    async fn scrape(&self, dry_run: bool) -> Result<IngestSummary> {
        self.scrape_sources(dry_run, &[]).await
    }

    async fn notify(&self) -> Result<NotifySummary> {
        self.notify_job().await?.run().await
    }

    async fn digest(&self) -> Result<DigestSummary> {
        self.digest_job().await?.run().await
    }
}

pub async fn run_scrape_from_env(dry_run: bool) -> Result<IngestSummary> {
    Runtime::from_env()?.scrape(dry_run).await
}

pub async fn run_notify_from_env() -> Result<NotifySummary> {
    Runtime::from_env()?.notify().await
}

pub async fn run_digest_from_env() -> Result<DigestSummary> {
    Runtime::from_env()?.digest().await
}
