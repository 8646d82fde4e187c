//! Snapshot poller support: the orderbook + recent-trades client and the
//! monotonic request guard that suppresses stale responses.

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::book::{BookLevel, Orderbook};
use crate::config::AppConfig;
use crate::types::{Market, Trade};
use crate::wire::{SnapshotRequest, SnapshotResponse, WireBook, WireLevel, opt_num};

/// Snapshot backend client; one POST per poll cycle.
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: Client,
    snapshot_url: Url,
}

impl SnapshotClient {
    pub fn new(http: Client, config: &AppConfig) -> Result<Self> {
        Ok(Self {
            http,
            snapshot_url: config.endpoints.snapshot_endpoint()?,
        })
    }

    /// Fetch the current snapshot for a market. Transport and HTTP failures
    /// are errors; a malformed body means "no data this cycle" (no book, no
    /// trades) rather than a failure.
    pub async fn fetch(&self, market: &Market) -> Result<(Option<Orderbook>, Vec<Trade>)> {
        let request = SnapshotRequest {
            market_url: market.page_url(),
            yes_token_id: market.yes_token_id.clone(),
            no_token_id: market.no_token_id.clone(),
        };
        let response = self
            .http
            .post(self.snapshot_url.clone())
            .json(&request)
            .send()
            .await
            .context("failed to send snapshot request")?
            .error_for_status()
            .context("snapshot request rejected")?;
        let raw = response
            .bytes()
            .await
            .context("failed to read snapshot response")?;
        let parsed: SnapshotResponse = match serde_json::from_slice(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("malformed snapshot response for {}: {err}", market.slug);
                return Ok((None, Vec::new()));
            }
        };
        let book = parsed.orderbook.map(build_orderbook);
        let trades = parsed
            .recent_trades
            .into_iter()
            .filter_map(|row| row.into_trade(market))
            .collect();
        Ok((book, trades))
    }
}

/// Convert wire levels into the internal book. Sources disagree on price
/// scale: a book whose prices all sit in `[0, 1]` is probability-scaled and
/// gets converted to cents.
fn build_orderbook(wire: WireBook) -> Orderbook {
    let mut bids = levels(wire.bids);
    let mut asks = levels(wire.asks);
    let max_price = bids
        .iter()
        .chain(asks.iter())
        .map(|level| level.price)
        .fold(0.0_f64, f64::max);
    if max_price > 0.0 && max_price <= 1.0 {
        for level in bids.iter_mut().chain(asks.iter_mut()) {
            level.price *= 100.0;
        }
    }
    Orderbook::from_yes_levels(bids, asks)
}

fn levels(wire: Vec<WireLevel>) -> Vec<BookLevel> {
    wire.into_iter()
        .filter_map(|level| {
            let price = opt_num(&level.price)?;
            let size = opt_num(&level.size)?;
            (price.is_finite() && size.is_finite()).then_some(BookLevel { price, size })
        })
        .collect()
}

/// Monotonic request counter for stale-response suppression. Each fetch
/// captures [`RequestGuard::issue`]; only the most recently issued id is
/// admitted, so a slow response for a previously selected market can never
/// overwrite newer state.
#[derive(Debug, Default)]
pub struct RequestGuard {
    counter: u64,
}

impl RequestGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment then capture: the returned id marks the newest request.
    pub fn issue(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Whether a response for `id` is still current.
    pub fn admit(&self, id: u64) -> bool {
        id == self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    // ── request guard ──────────────────────────────────────────────────

    #[test]
    fn only_the_newest_request_is_admitted() {
        let mut guard = RequestGuard::new();
        let a = guard.issue();
        assert!(guard.admit(a));

        let b = guard.issue();
        assert!(!guard.admit(a), "response A arrived after B was issued");
        assert!(guard.admit(b));
    }

    #[test]
    fn issue_is_strictly_increasing() {
        let mut guard = RequestGuard::new();
        let ids: Vec<u64> = (0..4).map(|_| guard.issue()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    // ── book construction ──────────────────────────────────────────────

    fn wire_book(value: serde_json::Value) -> WireBook {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn cent_scaled_books_pass_through() {
        let book = build_orderbook(wire_book(json!({
            "bids": [{"price": 55.0, "size": 10.0}],
            "asks": [{"price": 60.0, "size": 5.0}]
        })));
        assert!(approx_eq(book.best_yes_bid().unwrap(), 55.0));
        assert!(approx_eq(book.best_yes_ask().unwrap(), 60.0));
        assert!(approx_eq(book.no_bids[0].price, 40.0));
    }

    #[test]
    fn probability_scaled_books_are_converted_to_cents() {
        let book = build_orderbook(wire_book(json!({
            "bids": [{"price": 0.55, "size": 10.0}],
            "asks": [{"price": 0.60, "size": 5.0}]
        })));
        assert!(approx_eq(book.best_yes_bid().unwrap(), 55.0));
        assert!(approx_eq(book.best_yes_ask().unwrap(), 60.0));
    }

    #[test]
    fn string_levels_and_junk_rows_are_handled() {
        let book = build_orderbook(wire_book(json!({
            "bids": [
                {"price": "55", "size": "10"},
                {"price": "junk", "size": 1.0},
                {"size": 3.0}
            ],
            "asks": []
        })));
        assert_eq!(book.yes_bids.len(), 1);
        assert!(approx_eq(book.yes_bids[0].price, 55.0));
    }

    #[test]
    fn empty_book_stays_empty() {
        let book = build_orderbook(wire_book(json!({"bids": [], "asks": []})));
        assert!(book.yes_bids.is_empty());
        assert!(book.spread().is_none());
    }
}
