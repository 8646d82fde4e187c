//! Wire-level payloads for the gateway backends and the trade stream.
//!
//! Everything arriving from the network is deserialized into these types at
//! the boundary and converted into the internal `types` structs right away;
//! raw JSON never reaches session logic. Fields the backends sometimes omit
//! or send in a different representation (string numbers, millisecond
//! timestamps) are normalized here.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{Market, Trade, TradeFilter, TradeSide};

/// Timestamps above this are milliseconds and get normalized to seconds.
const MS_TIMESTAMP_FLOOR: i64 = 10_000_000_000;

/// Stream protocol version sent with every client message.
const STREAM_VERSION: u32 = 1;

/// A numeric field that some backends send as a JSON number and others as a
/// string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Num(f64),
    Text(String),
}

impl WireNumber {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

pub fn opt_num(value: &Option<WireNumber>) -> Option<f64> {
    value.as_ref().and_then(WireNumber::value)
}

/// Prices arrive as probabilities in `[0, 1]`; values above 1 are cents and
/// get scaled down. Anything non-finite or out of range is rejected.
fn normalize_price(price: f64) -> Option<f64> {
    if !price.is_finite() || price < 0.0 {
        return None;
    }
    let price = if price > 1.0 { price / 100.0 } else { price };
    (0.0..=1.0).contains(&price).then_some(price)
}

fn normalize_timestamp(ts: i64) -> i64 {
    if ts > MS_TIMESTAMP_FLOOR { ts / 1000 } else { ts }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ── client → stream ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    Subscribe,
    Update,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_slugs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
}

impl FilterPayload {
    fn from_filter(filter: &TradeFilter) -> Self {
        match filter {
            TradeFilter::MarketSlug(slug) => Self {
                market_slugs: Some(vec![slug.clone()]),
                ..Self::default()
            },
            TradeFilter::ConditionId(id) => Self {
                condition_ids: Some(vec![id.clone()]),
                ..Self::default()
            },
            TradeFilter::Users(users) => Self {
                users: Some(users.clone()),
                ..Self::default()
            },
            TradeFilter::All => Self::default(),
        }
    }
}

/// Outbound stream message. `subscribe` opens a new subscription; `update`
/// retargets an acknowledged one in place.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMessage {
    pub action: ClientAction,
    pub platform: &'static str,
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub filters: FilterPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

impl ClientMessage {
    pub fn subscribe(filter: &TradeFilter) -> Self {
        Self {
            action: ClientAction::Subscribe,
            platform: "polymarket",
            version: STREAM_VERSION,
            kind: "orders",
            filters: FilterPayload::from_filter(filter),
            subscription_id: None,
        }
    }

    pub fn update(filter: &TradeFilter, subscription_id: &str) -> Self {
        Self {
            action: ClientAction::Update,
            subscription_id: Some(subscription_id.to_string()),
            ..Self::subscribe(filter)
        }
    }
}

// ── stream → client ────────────────────────────────────────────────────

/// Inbound stream message, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ack { subscription_id: String },
    Event { data: WireTrade },
    Error { message: String },
}

/// Raw order event. Field coverage varies between markets, so everything is
/// optional and validated in [`WireTrade::into_trade`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTrade {
    #[serde(default)]
    pub order_hash: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub price: Option<WireNumber>,
    #[serde(default)]
    pub raw_price: Option<WireNumber>,
    #[serde(default)]
    pub shares: Option<WireNumber>,
    #[serde(default)]
    pub shares_normalized: Option<WireNumber>,
    #[serde(default)]
    pub market_slug: Option<String>,
    #[serde(default)]
    pub event_slug: Option<String>,
    #[serde(default)]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub taker: Option<String>,
    #[serde(default)]
    pub token_label: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
}

impl WireTrade {
    /// Returns `None` when the event is missing something essential (side,
    /// price, shares, or any usable id).
    pub fn into_trade(self) -> Option<Trade> {
        let side = TradeSide::parse(self.side.as_deref()?)?;
        let price = normalize_price(opt_num(&self.price).or_else(|| opt_num(&self.raw_price))?)?;
        let shares = opt_num(&self.shares_normalized).or_else(|| opt_num(&self.shares))?;
        if !shares.is_finite() || shares < 0.0 {
            return None;
        }
        let timestamp =
            normalize_timestamp(self.timestamp.unwrap_or_else(|| Utc::now().timestamp()));
        let id = match non_empty(self.order_hash) {
            Some(hash) => hash,
            None => {
                let tx = non_empty(self.transaction_hash)?;
                format!("{tx}:{timestamp}:{}", self.index.unwrap_or(0))
            }
        };
        Some(Trade {
            id,
            side,
            price,
            shares,
            market_slug: non_empty(self.market_slug)
                .or_else(|| non_empty(self.event_slug))
                .unwrap_or_default(),
            condition_id: self.condition_id.unwrap_or_default(),
            timestamp,
            user: non_empty(self.user).or_else(|| non_empty(self.taker)),
            token_label: non_empty(self.token_label).or_else(|| non_empty(self.outcome)),
        })
    }
}

// ── gateway: catalog ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EventsRequest {
    pub action: &'static str,
    pub limit: usize,
    pub offset: usize,
    pub order: &'static str,
    pub ascending: bool,
}

impl EventsRequest {
    /// One catalog page, most active events first.
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            action: "getEvents",
            limit,
            offset,
            order: "volume24h",
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub events: Vec<WireEvent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub volume: Option<WireNumber>,
    #[serde(default)]
    pub volume_24h: Option<WireNumber>,
    #[serde(default)]
    pub liquidity: Option<WireNumber>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub outcomes: Vec<WireOutcome>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOutcome {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Probability in `[0, 1]`.
    #[serde(default)]
    pub yes_price: Option<WireNumber>,
    #[serde(default)]
    pub yes_token_id: Option<String>,
    #[serde(default)]
    pub no_token_id: Option<String>,
    #[serde(default)]
    pub condition_id: Option<String>,
}

// ── gateway: snapshot ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub market_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yes_token_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_token_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    #[serde(default)]
    pub orderbook: Option<WireBook>,
    #[serde(default)]
    pub recent_trades: Vec<WireSnapshotTrade>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBook {
    #[serde(default)]
    pub bids: Vec<WireLevel>,
    #[serde(default)]
    pub asks: Vec<WireLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireLevel {
    #[serde(default)]
    pub price: Option<WireNumber>,
    #[serde(default)]
    pub size: Option<WireNumber>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSnapshotTrade {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub price: Option<WireNumber>,
    #[serde(default)]
    pub raw_price: Option<WireNumber>,
    #[serde(default)]
    pub shares: Option<WireNumber>,
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl WireSnapshotTrade {
    /// Snapshot rows are scoped to one market, so the slug and condition id
    /// come from the market they were fetched for.
    pub fn into_trade(self, market: &Market) -> Option<Trade> {
        let id = non_empty(self.id)?;
        let side = TradeSide::parse(self.side.as_deref()?)?;
        let price = normalize_price(opt_num(&self.price).or_else(|| opt_num(&self.raw_price))?)?;
        let shares = opt_num(&self.shares)?;
        if !shares.is_finite() || shares < 0.0 {
            return None;
        }
        let timestamp =
            normalize_timestamp(self.timestamp.unwrap_or_else(|| Utc::now().timestamp()));
        Some(Trade {
            id,
            side,
            price,
            shares,
            market_slug: market.slug.clone(),
            condition_id: market.condition_id.clone(),
            timestamp,
            user: non_empty(self.wallet),
            token_label: non_empty(self.outcome),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_market() -> Market {
        Market {
            id: "mkt-1".to_string(),
            condition_id: "0xc1".to_string(),
            slug: "nfl-chiefs".to_string(),
            event_slug: "super-bowl-2026".to_string(),
            title: "Chiefs win".to_string(),
            description: None,
            image: None,
            yes_price: 65,
            no_price: 35,
            volume: 0.0,
            volume_24h: 0.0,
            liquidity: 0.0,
            end_date: None,
            yes_token_id: None,
            no_token_id: None,
        }
    }

    // ── client messages ────────────────────────────────────────────────

    #[test]
    fn subscribe_message_shape() {
        let filter = TradeFilter::MarketSlug("nfl-chiefs".to_string());
        let value = serde_json::to_value(ClientMessage::subscribe(&filter)).unwrap();
        assert_eq!(value["action"], "subscribe");
        assert_eq!(value["platform"], "polymarket");
        assert_eq!(value["version"], 1);
        assert_eq!(value["type"], "orders");
        assert_eq!(value["filters"]["market_slugs"], json!(["nfl-chiefs"]));
        assert!(value.get("subscription_id").is_none());
        assert!(value["filters"].get("condition_ids").is_none());
    }

    #[test]
    fn update_message_carries_subscription_id() {
        let filter = TradeFilter::ConditionId("0xc1".to_string());
        let value = serde_json::to_value(ClientMessage::update(&filter, "sub-7")).unwrap();
        assert_eq!(value["action"], "update");
        assert_eq!(value["subscription_id"], "sub-7");
        assert_eq!(value["filters"]["condition_ids"], json!(["0xc1"]));
    }

    #[test]
    fn wildcard_filter_serializes_empty() {
        let value = serde_json::to_value(ClientMessage::subscribe(&TradeFilter::All)).unwrap();
        assert_eq!(value["filters"], json!({}));
    }

    #[test]
    fn users_filter_lists_wallets() {
        let filter = TradeFilter::Users(vec!["0xaaa".to_string(), "0xbbb".to_string()]);
        let value = serde_json::to_value(ClientMessage::subscribe(&filter)).unwrap();
        assert_eq!(value["filters"]["users"], json!(["0xaaa", "0xbbb"]));
    }

    // ── server messages ────────────────────────────────────────────────

    #[test]
    fn server_message_parses_by_tag() {
        let ack: ServerMessage =
            serde_json::from_value(json!({"type": "ack", "subscription_id": "sub-1"})).unwrap();
        assert!(matches!(ack, ServerMessage::Ack { subscription_id } if subscription_id == "sub-1"));

        let error: ServerMessage =
            serde_json::from_value(json!({"type": "error", "message": "bad filter"})).unwrap();
        assert!(matches!(error, ServerMessage::Error { message } if message == "bad filter"));

        let event: ServerMessage = serde_json::from_value(json!({
            "type": "event",
            "data": {"orderHash": "0xabc", "side": "BUY", "price": 0.65, "shares": 10.0}
        }))
        .unwrap();
        assert!(matches!(event, ServerMessage::Event { .. }));

        assert!(serde_json::from_str::<ServerMessage>("{\"type\":\"nope\"}").is_err());
    }

    // ── trade conversion ───────────────────────────────────────────────

    fn wire_trade(value: serde_json::Value) -> WireTrade {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn trade_uses_order_hash_as_id() {
        let trade = wire_trade(json!({
            "orderHash": "0xhash",
            "side": "BUY",
            "price": 0.65,
            "sharesNormalized": 100.0,
            "marketSlug": "nfl-chiefs",
            "conditionId": "0xc1",
            "timestamp": 1_700_000_000,
            "user": "0xdead"
        }))
        .into_trade()
        .unwrap();
        assert_eq!(trade.id, "0xhash");
        assert_eq!(trade.side, TradeSide::Buy);
        assert!((trade.price - 0.65).abs() < 1e-9);
        assert!((trade.shares - 100.0).abs() < 1e-9);
        assert_eq!(trade.market_slug, "nfl-chiefs");
        assert_eq!(trade.user.as_deref(), Some("0xdead"));
    }

    #[test]
    fn trade_falls_back_to_composite_id() {
        let trade = wire_trade(json!({
            "transactionHash": "0xtx",
            "side": "SELL",
            "price": 0.4,
            "shares": 5.0,
            "timestamp": 1_700_000_000,
            "index": 2
        }))
        .into_trade()
        .unwrap();
        assert_eq!(trade.id, "0xtx:1700000000:2");
    }

    #[test]
    fn trade_without_any_id_is_dropped() {
        let trade = wire_trade(json!({
            "side": "BUY",
            "price": 0.5,
            "shares": 1.0,
            "timestamp": 1_700_000_000
        }));
        assert!(trade.into_trade().is_none());
    }

    #[test]
    fn millisecond_timestamps_are_normalized() {
        let trade = wire_trade(json!({
            "orderHash": "0xhash",
            "side": "BUY",
            "price": 0.5,
            "shares": 1.0,
            "timestamp": 1_700_000_000_000_i64
        }))
        .into_trade()
        .unwrap();
        assert_eq!(trade.timestamp, 1_700_000_000);
    }

    #[test]
    fn cent_scaled_prices_are_normalized() {
        let trade = wire_trade(json!({
            "orderHash": "0xhash",
            "side": "BUY",
            "price": 65,
            "shares": 1.0,
            "timestamp": 1_700_000_000
        }))
        .into_trade()
        .unwrap();
        assert!((trade.price - 0.65).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_price_is_dropped() {
        let trade = wire_trade(json!({
            "orderHash": "0xhash",
            "side": "BUY",
            "price": 150.0,
            "shares": 1.0,
            "timestamp": 1_700_000_000
        }));
        assert!(trade.into_trade().is_none());
    }

    #[test]
    fn string_numbers_are_accepted() {
        let trade = wire_trade(json!({
            "orderHash": "0xhash",
            "side": "BUY",
            "price": "0.42",
            "shares": "12.5",
            "timestamp": 1_700_000_000
        }))
        .into_trade()
        .unwrap();
        assert!((trade.price - 0.42).abs() < 1e-9);
        assert!((trade.shares - 12.5).abs() < 1e-9);
    }

    #[test]
    fn missing_side_drops_the_event() {
        let trade = wire_trade(json!({
            "orderHash": "0xhash",
            "price": 0.5,
            "shares": 1.0
        }));
        assert!(trade.into_trade().is_none());
    }

    // ── snapshot trades ────────────────────────────────────────────────

    #[test]
    fn snapshot_trade_inherits_market_identity() {
        let market = make_market();
        let row: WireSnapshotTrade = serde_json::from_value(json!({
            "id": "t-1",
            "side": "SELL",
            "outcome": "Yes",
            "price": 0.64,
            "shares": 50.0,
            "wallet": "0xdead",
            "timestamp": 1_700_000_000
        }))
        .unwrap();
        let trade = row.into_trade(&market).unwrap();
        assert_eq!(trade.market_slug, "nfl-chiefs");
        assert_eq!(trade.condition_id, "0xc1");
        assert_eq!(trade.token_label.as_deref(), Some("Yes"));
    }

    #[test]
    fn snapshot_trade_without_id_is_dropped() {
        let market = make_market();
        let row: WireSnapshotTrade = serde_json::from_value(json!({
            "side": "BUY",
            "price": 0.5,
            "shares": 1.0
        }))
        .unwrap();
        assert!(row.into_trade(&market).is_none());
    }
}
