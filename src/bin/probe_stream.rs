//! Raw explorer for the Polyterminal trade stream.
//!
//! Connects, subscribes to the trade firehose, and prints every frame for
//! 30 seconds: acks, trades, server errors, anything unrecognized. A slug
//! argument narrows the subscription to one market; one or more
//! `--user <wallet>` pairs narrow it to those wallets instead. Use it to
//! eyeball the wire format before touching the typed decoder.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use polyterminal_feed::STREAM_WS_URL;
use polyterminal_feed::types::TradeFilter;
use polyterminal_feed::wire::{ClientMessage, ServerMessage};

const RUN_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let mut users = Vec::new();
    let mut slug = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--user" {
            match args.next() {
                Some(wallet) => users.push(wallet),
                None => anyhow::bail!("--user requires a wallet address"),
            }
        } else {
            slug = Some(arg);
        }
    }
    let filter = if !users.is_empty() {
        TradeFilter::Users(users)
    } else {
        match slug {
            Some(slug) => TradeFilter::MarketSlug(slug),
            None => TradeFilter::All,
        }
    };

    println!("=== Stream Probe ===");
    println!("URL: {}", STREAM_WS_URL);
    println!("Filter: {:?}", filter);
    println!();

    let (ws, resp) = connect_async(STREAM_WS_URL).await?;
    println!("Connected, HTTP status: {}", resp.status());
    let (mut write, mut read) = ws.split();

    let subscribe = ClientMessage::subscribe(&filter);
    let json = serde_json::to_string(&subscribe)?;
    println!("Sending subscription: {json}");
    write.send(Message::Text(json.into())).await?;

    let start = Instant::now();
    let duration = Duration::from_secs(RUN_SECS);
    let mut last_ping = Instant::now();

    let mut total_frames = 0u64;
    let mut trades = 0u64;
    let mut undecoded = 0u64;
    let mut by_market: HashMap<String, usize> = HashMap::new();
    let mut subscription_id: Option<String> = None;

    loop {
        if start.elapsed() >= duration {
            break;
        }

        if last_ping.elapsed() >= Duration::from_secs(10) {
            let _ = write.send(Message::Ping(vec![].into())).await;
            last_ping = Instant::now();
        }

        match tokio::time::timeout(Duration::from_secs(1), read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                total_frames += 1;
                let elapsed = start.elapsed().as_secs_f64();
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(ServerMessage::Ack {
                        subscription_id: id,
                    }) => {
                        println!("[{elapsed:.1}s] ACK   | subscription_id={id}");
                        subscription_id = Some(id);
                    }
                    Ok(ServerMessage::Event { data }) => match data.into_trade() {
                        Some(trade) => {
                            trades += 1;
                            *by_market.entry(trade.market_slug.clone()).or_default() += 1;
                            println!(
                                "[{elapsed:.1}s] TRADE | {} {} {:.0} @ {:.3} (${:.2})",
                                trade.market_slug,
                                trade.side.label(),
                                trade.shares,
                                trade.price,
                                trade.notional(),
                            );
                        }
                        None => {
                            undecoded += 1;
                            println!(
                                "[{elapsed:.1}s] SKIP  | event without a usable trade: {}",
                                preview(text.as_str(), 120)
                            );
                        }
                    },
                    Ok(ServerMessage::Error { message }) => {
                        println!("[{elapsed:.1}s] ERROR | {message}");
                    }
                    Err(_) => {
                        undecoded += 1;
                        println!("[{elapsed:.1}s] RAW   | {}", preview(text.as_str(), 150));
                    }
                }
            }
            Ok(Some(Ok(Message::Ping(payload)))) => {
                let _ = write.send(Message::Pong(payload)).await;
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                println!("Server closed the connection: {:?}", frame);
                break;
            }
            Ok(Some(Ok(_))) => {} // pong, binary
            Ok(Some(Err(e))) => {
                eprintln!("Stream error: {}", e);
                break;
            }
            Ok(None) => {
                println!("Stream ended");
                break;
            }
            Err(_) => continue, // no frame this second
        }
    }

    let _ = write.send(Message::Close(None)).await;

    println!();
    println!("=== Summary ===");
    println!("Duration: {:.1}s", start.elapsed().as_secs_f64());
    println!(
        "Subscription: {}",
        subscription_id.as_deref().unwrap_or("(never acked)")
    );
    println!("Frames: {total_frames} ({trades} trades, {undecoded} undecoded)");
    if !by_market.is_empty() {
        let mut counts: Vec<_> = by_market.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        println!("Top markets:");
        for (slug, n) in counts.into_iter().take(10) {
            println!("  {n:>5}  {slug}");
        }
    }

    Ok(())
}

fn preview(text: &str, max: usize) -> String {
    if text.len() > max {
        format!("{}...", &text[..max])
    } else {
        text.to_string()
    }
}
