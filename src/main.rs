use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use feed_ingest::{parser, FetchConfig, HttpFetcher, IngestConfig, Ingestor, PgStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "feed-ingest", version, about = "Fetch registered RSS/Atom feeds and store new items")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[arg(long, env = "FEED_INGEST_MAX_CONNECTIONS", default_value_t = 5, global = true)]
    max_connections: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create tables and indexes if they do not exist
    SetupSchema,
    /// Refresh every registered feed once
    Refresh(RefreshArgs),
    /// List a user's unread items as JSON
    Unread {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Parse a local feed document and print its items as JSON
    Parse { path: PathBuf },
}

#[derive(Debug, Args)]
struct RefreshArgs {
    #[arg(long, env = "FEED_INGEST_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    #[arg(long, env = "FEED_INGEST_MAX_FEED_BYTES", default_value_t = 10 * 1024 * 1024)]
    max_feed_bytes: usize,

    #[arg(long, env = "FEED_INGEST_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    #[arg(long, env = "FEED_INGEST_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    #[arg(long, env = "FEED_INGEST_RETRY_DELAY_MS", default_value_t = 1000)]
    retry_delay_ms: u64,

    #[arg(long, env = "FEED_INGEST_USER_AGENT", default_value = "feed-ingest/0.1")]
    user_agent: String,
}

impl RefreshArgs {
    fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_body_bytes: self.max_feed_bytes,
            ..FetchConfig::default()
        }
    }

    fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            max_concurrent_fetches: self.concurrency,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Parse { path } => {
            let body = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let items = parser::parse_feed(Uuid::nil(), &body)?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Command::SetupSchema => {
            let store = connect(&cli).await?;
            store.setup_schema().await?;
        }
        Command::Unread { user, limit } => {
            let store = connect(&cli).await?;
            let items = store.unread_items(*user, *limit).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Command::Refresh(args) => {
            let store = Arc::new(connect(&cli).await?);
            let fetcher = Arc::new(HttpFetcher::new(args.fetch_config())?);
            let ingestor = Ingestor::new(store.clone(), store, fetcher, args.ingest_config());

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight feeds");
                    let _ = shutdown_tx.send(true);
                }
            });

            let batch = ingestor.refresh_all_with_shutdown(shutdown_rx).await?;
            for result in batch.per_feed.values().filter(|r| !r.is_done()) {
                error!(
                    "Feed {} ({}) did not complete: {}",
                    result.feed_id,
                    result.url,
                    result.error.as_deref().unwrap_or("cancelled")
                );
            }
            println!("{}", serde_json::to_string_pretty(&batch)?);
        }
    }

    Ok(())
}

async fn connect(cli: &Cli) -> anyhow::Result<PgStore> {
    let database_url = cli
        .database_url
        .as_deref()
        .context("DATABASE_URL or --database-url is required")?;

    info!("Connecting to database: {}", redact(database_url));
    let store = PgStore::connect(database_url, cli.max_connections).await?;
    Ok(store)
}

fn redact(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}
