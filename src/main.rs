// src/main.rs
// ntpu-bot - campus chat-bot backend

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use ntpu_bot::config::Config;

#[derive(Parser)]
#[command(name = "ntpu-bot", about = "Cache-first campus chat-bot backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server (default)
    Serve,
    /// Run one warmup cycle and exit
    Warmup,
    /// Run the TTL sweep and exit
    Cleanup {
        /// Delete expired rows instead of only counting them
        #[arg(long)]
        execute: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is a convenience for local runs; real deployments set the
    // environment directly.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("no .env loaded: {}", e);
    }

    let cli = Cli::parse();
    let config = Config::load();
    init_tracing(&config.log_level);

    let validation = config.validate();
    if !validation.is_valid() {
        anyhow::bail!("invalid configuration:\n{}", validation.report());
    }
    for warning in &validation.warnings {
        tracing::warn!("{}", warning);
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            ntpu_bot::server::serve(config).await?;
        }
        Commands::Warmup => {
            run_warmup_once(config).await?;
        }
        Commands::Cleanup { execute } => {
            run_cleanup(config, execute).await?;
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    let level = match log_level {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// One-shot warmup, for cron-style operation next to a running server.
async fn run_warmup_once(config: Config) -> Result<()> {
    use std::sync::Arc;

    let config = Arc::new(config);
    let metrics = Arc::new(ntpu_bot::metrics::Metrics::default());
    let store = Arc::new(ntpu_bot::store::Store::open(&config.sqlite_path).await?);
    let http = ntpu_bot::http::create_shared_client(config.scraper.timeout);
    let scraper = Arc::new(ntpu_bot::scrape::ScrapeClient::new(
        http,
        ntpu_bot::scrape::default_base_urls(),
        config.scraper.clone(),
        metrics.clone(),
    ));
    let index = Arc::new(ntpu_bot::index::CourseIndex::new());
    index.rebuild_from_store(&store).await?;

    let warmup = ntpu_bot::warmup::Warmup::new(
        config,
        store,
        scraper,
        index,
        metrics,
        tokio_util::sync::CancellationToken::new(),
    );
    let report = warmup.run_once().await;
    for module in &report.modules {
        println!(
            "{}: {} ok, {} failed{}",
            module.module,
            module.ok,
            module.failed,
            if module.is_degraded() { " (degraded)" } else { "" }
        );
    }
    println!(
        "index rebuilt: {}, swept rows: {}",
        report.index_rebuilt, report.swept_rows
    );
    Ok(())
}

/// One-shot TTL sweep. Dry-run by default.
async fn run_cleanup(config: Config, execute: bool) -> Result<()> {
    let store = ntpu_bot::store::Store::open(&config.sqlite_path).await?;
    if execute {
        let deleted = store.cleanup_expired(config.cache_ttl).await?;
        println!("deleted {deleted} expired rows");
    } else {
        let ttl = config.cache_ttl;
        let now = ntpu_bot::store::now_epoch();
        let candidates = store
            .pool()
            .read(move |conn| {
                ntpu_bot::store::retention::count_expired_sync(conn, ttl, now).map_err(Into::into)
            })
            .await?;
        println!("{candidates} rows past TTL (dry run; pass --execute to delete)");
    }
    Ok(())
}
