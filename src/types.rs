use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One tradeable YES/NO outcome, flattened out of an event.
///
/// Prices are integer cents in `[0, 100]` and `yes_price + no_price == 100`
/// by construction. A market is immutable once built; a new catalog fetch
/// produces new instances.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Market {
    pub id: String,
    pub condition_id: String,
    /// Outcome-level slug, the primary stream filter key.
    pub slug: String,
    /// Parent event slug.
    pub event_slug: String,
    pub title: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub yes_price: i64,
    pub no_price: i64,
    pub volume: f64,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub end_date: Option<DateTime<Utc>>,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
}

impl Market {
    /// Public market page URL; the snapshot backend resolves markets by it.
    pub fn page_url(&self) -> String {
        format!("https://polymarket.com/event/{}/{}", self.event_slug, self.slug)
    }

    /// Local guard against a stale subscription still delivering events for
    /// a previously selected market.
    pub fn matches_trade(&self, trade: &Trade) -> bool {
        trade.market_slug == self.slug
            || (!self.condition_id.is_empty() && trade.condition_id == self.condition_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// One executed order, merged into the ledger from either the snapshot seed
/// or the live push stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    /// Dedup key: order hash, else a `tx:timestamp:index` composite.
    pub id: String,
    pub side: TradeSide,
    /// Execution price as a probability in `[0, 1]`.
    pub price: f64,
    pub shares: f64,
    pub market_slug: String,
    pub condition_id: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub user: Option<String>,
    pub token_label: Option<String>,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.price * self.shares
    }

    pub fn is_whale(&self, min_usd: f64) -> bool {
        self.notional() >= min_usd
    }
}

/// Stream-side trade filter. When derived from a market the precedence is
/// slug, then condition id, then the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeFilter {
    MarketSlug(String),
    ConditionId(String),
    Users(Vec<String>),
    All,
}

impl TradeFilter {
    pub fn for_market(market: &Market) -> Self {
        if !market.slug.is_empty() {
            Self::MarketSlug(market.slug.clone())
        } else if !market.condition_id.is_empty() {
            Self::ConditionId(market.condition_id.clone())
        } else {
            Self::All
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Session health snapshot, published over the status watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedStatus {
    pub status: ConnectionStatus,
    pub subscription_id: Option<String>,
    pub reconnect_attempts: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub selected_slug: Option<String>,
    pub last_error: Option<String>,
}

impl FeedStatus {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            subscription_id: None,
            reconnect_attempts: 0,
            last_message_at: None,
            message_count: 0,
            selected_slug: None,
            last_error: None,
        }
    }

    /// A connected feed with no inbound message for longer than `threshold`
    /// is stale; a feed that is not connected is always stale.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        if self.status != ConnectionStatus::Connected {
            return true;
        }
        match self.last_message_at {
            Some(at) => (Utc::now() - at).num_seconds() > threshold.as_secs() as i64,
            None => true,
        }
    }
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::new()
    }
}
