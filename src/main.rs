//! `chat-harvest` CLI: fetch one conversation's messages for a date range and
//! print the report as JSON.
//!
//! ```bash
//! chat-harvest telegram friends 2024-03-01 2024-03-07 --timezone Europe/Berlin
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use chat_harvest::config::RetrievalConfig;
use chat_harvest::platforms::{PlatformRegistry, RedditAdapter, TelegramExportAdapter, WebexAdapter};
use chat_harvest::{GetMessagesRequest, MessageService, Platform};

/// Retrieve a conversation's messages with threads resolved.
#[derive(Parser)]
#[command(name = "chat-harvest", version, about)]
struct Cli {
    /// Platform: webex, reddit or telegram.
    platform: Platform,

    /// Room id, post id or export folder name.
    conversation: String,

    /// First day, inclusive (YYYY-MM-DD).
    start: NaiveDate,

    /// Last day, inclusive (YYYY-MM-DD).
    end: NaiveDate,

    /// Cache namespace for the requesting user.
    #[arg(long, env = "CHAT_HARVEST_USER", default_value = "default")]
    user: String,

    /// IANA zone (Europe/Berlin) or fixed offset (+02:00). Defaults to UTC.
    #[arg(long, env = "CHAT_HARVEST_TIMEZONE")]
    timezone: Option<String>,

    /// Ignore and do not write the day cache.
    #[arg(long, env = "CHAT_HARVEST_NO_CACHE")]
    no_cache: bool,

    /// Give up on the whole request after this many seconds.
    #[arg(long, env = "CHAT_HARVEST_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// JSON config file with per-platform sections.
    #[arg(long, env = "CHAT_HARVEST_CONFIG")]
    config: Option<PathBuf>,
}

/// Log to stderr, and to a daily file when CHAT_HARVEST_LOG_DIR is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::env::var("CHAT_HARVEST_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chat-harvest.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

/// Register the adapter for `platform` from its credentials.
fn build_registry(platform: Platform) -> anyhow::Result<PlatformRegistry> {
    let mut registry = PlatformRegistry::new();
    match platform {
        Platform::Webex => {
            let token = std::env::var("WEBEX_ACCESS_TOKEN").context("WEBEX_ACCESS_TOKEN not set")?;
            registry.register(Arc::new(WebexAdapter::new(secrecy::SecretString::from(token))));
        }
        Platform::Reddit => {
            let token = std::env::var("REDDIT_ACCESS_TOKEN").context("REDDIT_ACCESS_TOKEN not set")?;
            let user_agent = std::env::var("REDDIT_USER_AGENT")
                .unwrap_or_else(|_| format!("chat-harvest/{}", env!("CARGO_PKG_VERSION")));
            registry.register(Arc::new(RedditAdapter::new(secrecy::SecretString::from(token), user_agent)));
        }
        Platform::Telegram => {
            let dir = std::env::var("TELEGRAM_EXPORT_DIR").context("TELEGRAM_EXPORT_DIR not set")?;
            registry.register(Arc::new(TelegramExportAdapter::new(dir)));
        }
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let config = match &cli.config {
        Some(path) => RetrievalConfig::from_json_file(path, cli.platform)?.with_env()?,
        None => RetrievalConfig::from_env()?,
    };
    let service = MessageService::new(build_registry(cli.platform)?, config);

    let mut request = GetMessagesRequest::new(cli.platform, cli.user, cli.conversation, cli.start, cli.end);
    request.timezone = cli.timezone;
    request.use_cache = !cli.no_cache;
    request.timeout = cli.timeout_secs.map(Duration::from_secs);

    let report = service.get_messages(request).await?;
    for failed in &report.failed_ranges {
        eprintln!("warning: {} not retrieved: {}", failed.chunk, failed.reason);
    }
    if report.messages.is_empty() && report.failed_ranges.is_empty() {
        tracing::info!("No messages in range");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
