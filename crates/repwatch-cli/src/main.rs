use anyhow::Result;
use clap::{Parser, Subcommand};
use repwatch_notify::WebhookNotifier;
use repwatch_storage::{ReportFetcher, ReportStore};
use repwatch_sync::{BotConfig, ReportService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "repwatch")]
#[command(about = "Forum moderation report watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the report API and forward notifications (default).
    Run,
    /// Validate configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_bot().await,
        Commands::CheckConfig => {
            let config = BotConfig::from_env()?;
            println!(
                "configuration ok: polling {} every {}s, store at {}",
                config.report_api_url,
                config.poll_interval.as_secs(),
                config.db_path.display()
            );
            Ok(())
        }
    }
}

async fn run_bot() -> Result<()> {
    let config = BotConfig::from_env()?;

    let store = ReportStore::open(config.db_path.clone()).await?;
    let fetcher = ReportFetcher::new(config.fetch_config())?;
    let notifier = WebhookNotifier::new(config.webhook_url.clone(), config.http_timeout)?;
    let mut service = ReportService::new(fetcher, store, Box::new(notifier), config.report_url.clone());

    // First pass seeds the store without flooding the channel with every
    // currently open report.
    info!("populating initial report data");
    let summary = service.process_reports(false).await?;
    info!(new = summary.new_reports, "added initial reports");

    repwatch_sync::run(service, config.poll_interval).await
}
