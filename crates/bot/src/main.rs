use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use spendbot::{run_polling, BackendKind, Config, ExpensePipeline, TelegramClient};
use spendbot_extract::{GeminiBackend, GenerativeBackend, MediaNormalizer, RulesBackend};
use spendbot_storage::{LedgerBackend, LedgerWriter, ServiceAccountKey, SheetsBackend, SpreadsheetLocator};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telegram bot that logs expenses from text, receipt photos and voice notes
/// to a Google Sheet.
#[derive(Parser, Debug)]
#[command(name = "spendbot")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "SPENDBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Validate configuration and ledger access, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal in production.
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.log_level);

    info!("Starting Telegram Expense Tracker Bot");
    info!(backend = %config.extraction_backend, model = %config.gemini_model, "Extraction backend");
    info!(sheet = %config.google_sheet_name, "Ledger");

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Configuration validation failed");
        return Err(e).context("Configuration validation failed, check your .env file");
    }
    info!("Configuration validated");

    let ledger = build_ledger(&config).await?;
    verify_ledger(&config, Arc::clone(&ledger)).await?;
    if args.check {
        info!("Check passed");
        return Ok(());
    }

    let token = config.telegram_bot_token.clone().context("TELEGRAM_BOT_TOKEN is not set")?;
    let client = Arc::new(
        TelegramClient::new(token, config.request_timeout()).context("Failed to build Telegram client")?,
    );

    let pipeline = ExpensePipeline::new(config.schema(), build_backend(&config)?, ledger, client.clone())
        .with_retry(config.retry_policy())
        .with_normalizer(MediaNormalizer::new(config.max_file_bytes()))
        .with_summary_limit(config.summary_limit);

    info!("Bot is running, press Ctrl+C to stop");
    run_polling(client, Arc::new(pipeline), config.poll_timeout(), shutdown_signal()).await;

    info!("Bot stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,reqwest=warn")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_backend(config: &Config) -> Result<Arc<dyn GenerativeBackend>> {
    match config.extraction_backend {
        BackendKind::Gemini => {
            let key = config.gemini_api_key.clone().context("GEMINI_API_KEY is not set")?;
            let backend = GeminiBackend::new(key, config.gemini_model.clone(), config.request_timeout())
                .context("Failed to build Gemini client")?;
            Ok(Arc::new(backend))
        }
        BackendKind::Rules => {
            tracing::warn!("Using the offline rules backend; photos and voice notes will not be understood");
            Ok(Arc::new(RulesBackend))
        }
    }
}

async fn build_ledger(config: &Config) -> Result<Arc<dyn LedgerBackend>> {
    let creds = config
        .google_sheets_creds_file
        .as_deref()
        .context("GOOGLE_SHEETS_CREDS_FILE is not set")?;
    let key = ServiceAccountKey::from_file(creds)
        .await
        .with_context(|| format!("Failed to read service account credentials from {}", creds.display()))?;

    let locator = match &config.google_spreadsheet_id {
        Some(id) => SpreadsheetLocator::Id(id.clone()),
        None => SpreadsheetLocator::Name(config.google_sheet_name.clone()),
    };
    let backend = SheetsBackend::new(key, locator, config.request_timeout()).context("Failed to build Sheets client")?;
    Ok(Arc::new(backend))
}

async fn verify_ledger(config: &Config, ledger: Arc<dyn LedgerBackend>) -> Result<()> {
    info!("Verifying Google Sheets access");
    let writer = LedgerWriter::new(ledger, config.schema());
    if !writer.ensure_header().await {
        tracing::error!(
            creds = ?config.google_sheets_creds_file,
            sheet = %config.google_sheet_name,
            "Check the credentials file, the sheet name, and that the service account can edit the sheet"
        );
        bail!("Google Sheets verification failed for '{}'", config.google_sheet_name);
    }
    info!(sheet = %config.google_sheet_name, "Connected to sheet");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
