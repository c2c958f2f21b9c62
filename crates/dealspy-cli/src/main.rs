use anyhow::Result;
use clap::{Parser, Subcommand};
use dealspy_core::Source;
use dealspy_sync::{CronJobs, Runtime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealspy-cli")]
#[command(about = "DealSpy insolvency and auction deal monitor")]
struct Cli {
    /// Print job summaries as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape enabled sources and store new deals.
    Scrape {
        /// Scrape and report only; nothing is stored, enriched or alerted.
        #[arg(long)]
        dry_run: bool,
        /// Limit the run to these sources (repeatable).
        #[arg(long = "source", value_name = "SOURCE")]
        sources: Vec<Source>,
    },
    /// Send push and Telegram notifications for unnotified deals.
    Notify,
    /// Send the daily email digest.
    Digest,
    Migrate,
    /// Serve the cron trigger endpoints.
    Serve,
    /// List the source registry.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Scrape {
        dry_run: false,
        sources: Vec::new(),
    });

    match command {
        Commands::Scrape { dry_run, sources } => {
            let summary = Runtime::from_env()?.scrape_sources(dry_run, &sources).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "scrape complete: run_id={} scraped={} new={} duplicates={} failed={} source_errors={} fallback={}",
                    summary.run_id,
                    summary.stats.total_deals,
                    summary.stored.new_deals,
                    summary.stored.duplicates,
                    summary.stored.failed,
                    summary.stats.errors.len(),
                    summary.stats.fallback_sources.len(),
                );
            }
        }
        Commands::Notify => {
            let summary = Runtime::from_env()?.notify().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "notify complete: run_id={} deals={} sent={} failed={}",
                    summary.run_id,
                    summary.deals_processed,
                    summary.channels.total_sent(),
                    summary.channels.total_failed(),
                );
            }
        }
        Commands::Digest => {
            let summary = Runtime::from_env()?.digest().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "digest complete: deals={} sent={} failed={} skipped={}",
                    summary.total_deals, summary.sent, summary.failed, summary.skipped
                );
            }
        }
        Commands::Migrate => {
            Runtime::from_env()?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            dealspy_web::serve_from_env().await?;
        }
        Commands::Sources => {
            let registry = Runtime::from_env()?.registry().await?;
            for entry in &registry.sources {
                println!(
                    "{:<14} {:<8} {}",
                    entry.source,
                    if entry.enabled { "enabled" } else { "disabled" },
                    entry.display_name.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}
