//! Orderbook model: yes-side levels from the snapshot plus the derived
//! no-side view.

use serde::Serialize;

/// One price level. Price is in cents, size in shares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Orderbook {
    pub yes_bids: Vec<BookLevel>,
    pub yes_asks: Vec<BookLevel>,
    pub no_bids: Vec<BookLevel>,
    pub no_asks: Vec<BookLevel>,
}

impl Orderbook {
    /// Build the full book from yes-side levels. Zero-size levels are
    /// dropped, bids sort descending, asks ascending. The no side is derived
    /// by price inversion (`price_no = 100 - price_yes`): a resting yes ask
    /// is buying interest on the no side and vice versa.
    pub fn from_yes_levels(mut yes_bids: Vec<BookLevel>, mut yes_asks: Vec<BookLevel>) -> Self {
        yes_bids.retain(|level| level.size > 0.0);
        yes_asks.retain(|level| level.size > 0.0);
        sort_bids(&mut yes_bids);
        sort_asks(&mut yes_asks);

        let mut no_bids: Vec<BookLevel> = yes_asks.iter().map(invert).collect();
        let mut no_asks: Vec<BookLevel> = yes_bids.iter().map(invert).collect();
        sort_bids(&mut no_bids);
        sort_asks(&mut no_asks);

        Self {
            yes_bids,
            yes_asks,
            no_bids,
            no_asks,
        }
    }

    pub fn best_yes_bid(&self) -> Option<f64> {
        self.yes_bids.first().map(|level| level.price)
    }

    pub fn best_yes_ask(&self) -> Option<f64> {
        self.yes_asks.first().map(|level| level.price)
    }

    /// Best ask minus best bid, only when both sides have depth.
    pub fn spread(&self) -> Option<f64> {
        match (self.best_yes_bid(), self.best_yes_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Midpoint of the yes book, falling back to the market's last known
    /// yes price when either side is empty.
    pub fn mid_price(&self, fallback_yes_cents: i64) -> f64 {
        match (self.best_yes_bid(), self.best_yes_ask()) {
            (Some(bid), Some(ask)) => (bid + ask) / 2.0,
            _ => fallback_yes_cents as f64,
        }
    }
}

fn invert(level: &BookLevel) -> BookLevel {
    BookLevel {
        price: 100.0 - level.price,
        size: level.size,
    }
}

fn sort_bids(levels: &mut [BookLevel]) {
    levels.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
}

fn sort_asks(levels: &mut [BookLevel]) {
    levels.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, size: f64) -> BookLevel {
        BookLevel { price, size }
    }

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    // ── no-side derivation ─────────────────────────────────────────────

    #[test]
    fn yes_ask_becomes_no_bid_at_inverted_price() {
        let book = Orderbook::from_yes_levels(vec![], vec![level(60.0, 5.0)]);
        assert_eq!(book.no_bids.len(), 1);
        assert!(approx_eq(book.no_bids[0].price, 40.0));
        assert!(approx_eq(book.no_bids[0].size, 5.0));
        assert!(book.no_asks.is_empty());
    }

    #[test]
    fn yes_bid_becomes_no_ask() {
        let book = Orderbook::from_yes_levels(vec![level(55.0, 10.0)], vec![]);
        assert_eq!(book.no_asks.len(), 1);
        assert!(approx_eq(book.no_asks[0].price, 45.0));
    }

    // ── filtering and sorting ──────────────────────────────────────────

    #[test]
    fn zero_size_levels_are_dropped() {
        let book = Orderbook::from_yes_levels(
            vec![level(55.0, 0.0), level(54.0, 3.0)],
            vec![level(60.0, 0.0)],
        );
        assert_eq!(book.yes_bids.len(), 1);
        assert!(book.yes_asks.is_empty());
        assert!(book.no_bids.is_empty());
    }

    #[test]
    fn bids_sort_descending_and_asks_ascending() {
        let book = Orderbook::from_yes_levels(
            vec![level(50.0, 1.0), level(55.0, 1.0), level(52.0, 1.0)],
            vec![level(61.0, 1.0), level(58.0, 1.0), level(60.0, 1.0)],
        );
        let bid_prices: Vec<f64> = book.yes_bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<f64> = book.yes_asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![55.0, 52.0, 50.0]);
        assert_eq!(ask_prices, vec![58.0, 60.0, 61.0]);

        // derived no side stays properly ordered too
        let no_bid_prices: Vec<f64> = book.no_bids.iter().map(|l| l.price).collect();
        assert_eq!(no_bid_prices, vec![42.0, 40.0, 39.0]);
    }

    // ── spread and mid ─────────────────────────────────────────────────

    #[test]
    fn spread_needs_both_sides() {
        let book = Orderbook::from_yes_levels(vec![level(55.0, 1.0)], vec![level(58.0, 1.0)]);
        assert!(approx_eq(book.spread().unwrap(), 3.0));

        let one_sided = Orderbook::from_yes_levels(vec![level(55.0, 1.0)], vec![]);
        assert!(one_sided.spread().is_none());
    }

    #[test]
    fn mid_price_falls_back_to_market_price() {
        let book = Orderbook::from_yes_levels(vec![level(55.0, 1.0)], vec![level(59.0, 1.0)]);
        assert!(approx_eq(book.mid_price(65), 57.0));

        let empty = Orderbook::from_yes_levels(vec![], vec![]);
        assert!(approx_eq(empty.mid_price(65), 65.0));
    }
}
