use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use polyterminal_feed::config::{AppConfig, CONFIG_PATH};
use polyterminal_feed::reporter;
use polyterminal_feed::session::{FeedSession, SessionOptions};

#[derive(Parser)]
#[command(name = "feed", about = "Polyterminal live market feed client")]
struct Args {
    /// Follow a single market by slug (default: first market in the catalog)
    #[arg(long, conflicts_with = "all")]
    market: Option<String>,

    /// Follow trades across every market instead of one
    #[arg(long, conflicts_with = "market")]
    all: bool,

    /// Keep only whale-sized trades in the ledger
    #[arg(long)]
    whale_only: bool,

    /// Minimum trade notional in USD to count as a whale
    #[arg(long)]
    whale_min: Option<f64>,

    /// Extra catalog pages to load after the first
    #[arg(long, default_value_t = 0)]
    pages: usize,

    /// Stop after this many seconds (default: run until Ctrl+C)
    #[arg(long)]
    duration: Option<u64>,

    /// Config file path
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Write a default config file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.init_config {
        if args.config.exists() {
            anyhow::bail!(
                "{} already exists, refusing to overwrite",
                args.config.display()
            );
        }
        AppConfig::default().save(&args.config)?;
        info!("Wrote default config to {}", args.config.display());
        return Ok(());
    }

    if let Some(min) = args.whale_min {
        if min <= 0.0 {
            anyhow::bail!("--whale-min must be positive");
        }
    }
    if args.duration == Some(0) {
        anyhow::bail!("--duration must be positive");
    }

    let config = AppConfig::load_or_default(&args.config)?;
    if args.config.exists() {
        info!("Loaded config from {}", args.config.display());
    } else {
        info!("No {} found, using defaults", args.config.display());
    }

    let mode = if args.all {
        "all markets".to_string()
    } else if let Some(slug) = &args.market {
        format!("market {slug}")
    } else {
        "auto-select".to_string()
    };
    info!(
        "Starting feed ({mode}): whale_only={} poll_interval={}s",
        args.whale_only, config.feed.poll_interval_secs,
    );

    let options = SessionOptions {
        market_slug: args.market.clone(),
        follow_all: args.all,
        whale_only: args.whale_only,
        whale_min_usd: args.whale_min,
    };
    let mut session = FeedSession::start(config, options).await?;

    for _ in 0..args.pages {
        session.load_more();
    }

    let deadline = args
        .duration
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    info!("Feed running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = run_until(deadline) => {
                info!("Run duration elapsed");
                break;
            }
            event = session.next_event() => match event {
                Some(event) => reporter::report_event(&event),
                None => {
                    warn!("Session ended unexpectedly");
                    break;
                }
            }
        }
    }

    let summary = session.stop().await;
    reporter::report_exit_summary(&summary);

    Ok(())
}

/// Resolves at the deadline, or never when no duration was given.
async fn run_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
