//! Snapshot backend probe.
//!
//! Loads the first catalog page, resolves one market (first argument as a
//! slug, else the top of the page), fetches its orderbook and trade
//! snapshot, and prints what came back: book depth per side, spread and
//! mid, recent trades with their age, aggregate flow.

use std::path::Path;
use std::time::Instant;

use anyhow::{Result, bail};
use chrono::Utc;

use polyterminal_feed::book::BookLevel;
use polyterminal_feed::catalog::{CatalogClient, MarketCatalog};
use polyterminal_feed::config::{AppConfig, CONFIG_PATH};
use polyterminal_feed::ledger::FlowStats;
use polyterminal_feed::snapshot::SnapshotClient;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::load_or_default(Path::new(CONFIG_PATH))?;

    let http = reqwest::Client::new();
    let catalog_client = CatalogClient::new(http.clone(), &config)?;
    let snapshot_client = SnapshotClient::new(http, &config)?;

    println!("=== Snapshot Probe ===");
    println!();

    // --- 1. Catalog page 0 ---
    println!("--- 1. Catalog page 0 ---");
    let start = Instant::now();
    let markets = catalog_client.fetch_events(0).await?;
    println!("Fetched {} market(s) in {:?}", markets.len(), start.elapsed());

    let mut catalog = MarketCatalog::new();
    catalog.append_unique(markets);
    for market in catalog.markets().iter().take(5) {
        println!(
            "  {}  yes={}c no={}c vol24h=${:.0}",
            market.slug, market.yes_price, market.no_price, market.volume_24h
        );
    }
    println!();

    // --- 2. Resolve target market ---
    let slug = match std::env::args().nth(1) {
        Some(slug) => slug,
        None => match catalog.first_slug() {
            Some(slug) => slug.to_string(),
            None => bail!("catalog page was empty"),
        },
    };
    let Some(market) = catalog.select_slug(&slug) else {
        bail!("market slug not found on the first page: {slug}");
    };
    let market = market.clone();
    println!("--- 2. Market ---");
    println!("  slug:  {}", market.slug);
    println!("  title: {}", market.title);
    println!("  url:   {}", market.page_url());
    println!();

    // --- 3. Snapshot ---
    println!("--- 3. Snapshot ---");
    let start = Instant::now();
    let (book, trades) = snapshot_client.fetch(&market).await?;
    println!("Fetched in {:?}", start.elapsed());

    match &book {
        Some(book) => {
            print_side("YES bids", &book.yes_bids);
            print_side("YES asks", &book.yes_asks);
            print_side("NO bids", &book.no_bids);
            print_side("NO asks", &book.no_asks);
            match book.spread() {
                Some(spread) => println!("  spread: {:.1}c", spread),
                None => println!("  spread: n/a (one-sided book)"),
            }
            println!("  mid:    {:.1}c", book.mid_price(market.yes_price));
        }
        None => println!("  (no orderbook in response)"),
    }
    println!();

    // --- 4. Recent trades ---
    println!("--- 4. Recent trades ({} returned) ---", trades.len());
    let now = Utc::now().timestamp();
    for trade in trades.iter().take(10) {
        let age = now.saturating_sub(trade.timestamp);
        println!(
            "  {:>4} {:>8.0} @ {:.3}  ${:>8.2}  {}s ago",
            trade.side.label(),
            trade.shares,
            trade.price,
            trade.notional(),
            age,
        );
    }
    let stats = FlowStats::compute(&trades, config.feed.whale_min_usd);
    println!();
    println!(
        "  buys=${:.0} sells=${:.0} net=${:+.0} whales={}",
        stats.buy_volume, stats.sell_volume, stats.net_flow, stats.whale_count
    );

    println!();
    println!("=== Probe Complete ===");
    Ok(())
}

fn print_side(label: &str, levels: &[BookLevel]) {
    println!("  {label} ({} levels):", levels.len());
    for level in levels.iter().take(5) {
        println!("    {:>5.1}c x {:>10.2}", level.price, level.size);
    }
}
