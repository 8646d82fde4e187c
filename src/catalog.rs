//! Market catalog: paginated event fetching from the gateway and the
//! flattening of the event → outcomes hierarchy into tradeable markets.

use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use tracing::debug;
use url::Url;

use crate::config::AppConfig;
use crate::types::Market;
use crate::wire::{EventsRequest, EventsResponse, WireEvent, WireOutcome, opt_num};

/// Gateway catalog client; one POST per page.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: Client,
    markets_url: Url,
    page_size: usize,
}

impl CatalogClient {
    pub fn new(http: Client, config: &AppConfig) -> Result<Self> {
        Ok(Self {
            http,
            markets_url: config.endpoints.markets_endpoint()?,
            page_size: config.feed.page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetch one catalog page and flatten it. Network and malformed-response
    /// failures surface as errors and never hand back partial pages.
    pub async fn fetch_events(&self, offset: usize) -> Result<Vec<Market>> {
        let request = EventsRequest::page(self.page_size, offset);
        let response = self
            .http
            .post(self.markets_url.clone())
            .json(&request)
            .send()
            .await
            .context("failed to send catalog request")?
            .error_for_status()
            .context("catalog request rejected")?;
        let body: EventsResponse = response
            .json()
            .await
            .context("failed to decode catalog response")?;
        if !body.success {
            bail!("catalog backend reported failure");
        }
        let event_count = body.events.len();
        let markets = flatten_events(body.events);
        debug!(
            "catalog page offset={offset}: {event_count} events, {} markets",
            markets.len()
        );
        Ok(markets)
    }
}

/// Flatten events into markets: one market per outcome, plus one 50/50
/// fallback pseudo-market for events without outcomes. Rows missing a
/// title, slug, or event slug, or with a price outside `[0, 100]`, are
/// dropped.
pub fn flatten_events(events: Vec<WireEvent>) -> Vec<Market> {
    let mut markets = Vec::new();
    for mut event in events {
        let outcomes = std::mem::take(&mut event.outcomes);
        if outcomes.is_empty() {
            if let Some(market) = fallback_market(&event) {
                markets.push(market);
            }
        } else {
            for outcome in outcomes {
                if let Some(market) = outcome_to_market(&event, outcome) {
                    markets.push(market);
                }
            }
        }
    }
    markets
}

fn outcome_to_market(event: &WireEvent, outcome: WireOutcome) -> Option<Market> {
    let slug = non_empty(outcome.slug)?;
    let event_slug = non_empty(event.slug.clone())?;
    let title = non_empty(outcome.title).or_else(|| non_empty(event.title.clone()))?;
    let yes_price = probability_to_cents(opt_num(&outcome.yes_price)?)?;
    let id = non_empty(outcome.id)
        .unwrap_or_else(|| format!("{}:{}", event.id.clone().unwrap_or_default(), slug));
    Some(Market {
        id,
        condition_id: outcome.condition_id.unwrap_or_default(),
        slug,
        event_slug,
        title,
        description: event.description.clone(),
        image: outcome.image.or_else(|| event.image.clone()),
        yes_price,
        no_price: 100 - yes_price,
        volume: opt_num(&event.volume).unwrap_or(0.0),
        volume_24h: opt_num(&event.volume_24h).unwrap_or(0.0),
        liquidity: opt_num(&event.liquidity).unwrap_or(0.0),
        end_date: event.end_date.as_deref().and_then(parse_end_date),
        yes_token_id: non_empty(outcome.yes_token_id),
        no_token_id: non_empty(outcome.no_token_id),
    })
}

/// Events without outcomes still browse as a single market priced 50/50.
fn fallback_market(event: &WireEvent) -> Option<Market> {
    let event_slug = non_empty(event.slug.clone())?;
    let title = non_empty(event.title.clone())?;
    Some(Market {
        id: non_empty(event.id.clone()).unwrap_or_else(|| event_slug.clone()),
        condition_id: String::new(),
        slug: event_slug.clone(),
        event_slug,
        title,
        description: event.description.clone(),
        image: event.image.clone(),
        yes_price: 50,
        no_price: 50,
        volume: opt_num(&event.volume).unwrap_or(0.0),
        volume_24h: opt_num(&event.volume_24h).unwrap_or(0.0),
        liquidity: opt_num(&event.liquidity).unwrap_or(0.0),
        end_date: event.end_date.as_deref().and_then(parse_end_date),
        yes_token_id: None,
        no_token_id: None,
    })
}

/// Convert a wire probability (`0.65`) to integer cents (`65`) exactly.
/// Plain f64 multiplication would put `0.65 * 100` at `65.00000000000001`;
/// going through `Decimal` avoids that. Values outside `[0, 100]` cents are
/// rejected.
pub fn probability_to_cents(probability: f64) -> Option<i64> {
    let cents = (Decimal::from_f64_retain(probability)? * dec!(100))
        .round()
        .to_i64()?;
    (0..=100).contains(&cents).then_some(cents)
}

/// End dates arrive as RFC 3339 or bare `YYYY-MM-DD`; anything else reads
/// as absent rather than failing the page.
fn parse_end_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Ordered market list with a single selected pointer. Appends are
/// deduplicated by id so "load more" never duplicates rows.
#[derive(Debug, Default)]
pub struct MarketCatalog {
    markets: Vec<Market>,
    selected: Option<usize>,
}

impl MarketCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn markets(&self) -> &[Market] {
        &self.markets
    }

    /// Append markets not already present. Returns how many were added.
    pub fn append_unique(&mut self, incoming: Vec<Market>) -> usize {
        let mut known: HashSet<String> = self.markets.iter().map(|m| m.id.clone()).collect();
        let mut added = 0;
        for market in incoming {
            if known.insert(market.id.clone()) {
                self.markets.push(market);
                added += 1;
            }
        }
        added
    }

    pub fn first_slug(&self) -> Option<&str> {
        self.markets.first().map(|m| m.slug.as_str())
    }

    /// Select by outcome slug. Returns the market when found; an unknown
    /// slug leaves the current selection in place.
    pub fn select_slug(&mut self, slug: &str) -> Option<&Market> {
        let index = self.markets.iter().position(|m| m.slug == slug)?;
        self.selected = Some(index);
        self.markets.get(index)
    }

    pub fn selected(&self) -> Option<&Market> {
        self.selected.and_then(|index| self.markets.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_event(value: serde_json::Value) -> WireEvent {
        serde_json::from_value(value).unwrap()
    }

    fn two_outcome_event() -> WireEvent {
        make_event(json!({
            "id": "evt-1",
            "slug": "super-bowl-2026",
            "title": "Super Bowl 2026",
            "volume": 1_000_000.0,
            "volume24h": 50_000.0,
            "liquidity": 25_000.0,
            "endDate": "2026-02-08T23:00:00Z",
            "outcomes": [
                {
                    "id": "out-1",
                    "slug": "nfl-chiefs",
                    "title": "Chiefs win",
                    "yesPrice": 0.65,
                    "conditionId": "0xc1",
                    "yesTokenId": "tok-yes",
                    "noTokenId": "tok-no"
                },
                {
                    "id": "out-2",
                    "slug": "nfl-raiders",
                    "title": "Raiders win",
                    "yesPrice": 0.30,
                    "conditionId": "0xc2"
                }
            ]
        }))
    }

    // ── probability conversion ─────────────────────────────────────────

    #[test]
    fn probabilities_convert_to_exact_cents() {
        assert_eq!(probability_to_cents(0.65), Some(65));
        assert_eq!(probability_to_cents(0.30), Some(30));
        assert_eq!(probability_to_cents(0.07), Some(7));
        assert_eq!(probability_to_cents(0.0), Some(0));
        assert_eq!(probability_to_cents(1.0), Some(100));
    }

    #[test]
    fn out_of_range_probabilities_are_rejected() {
        assert_eq!(probability_to_cents(1.5), None);
        assert_eq!(probability_to_cents(-0.1), None);
        assert_eq!(probability_to_cents(f64::NAN), None);
    }

    // ── flattening ─────────────────────────────────────────────────────

    #[test]
    fn each_outcome_becomes_one_market() {
        let markets = flatten_events(vec![two_outcome_event()]);
        assert_eq!(markets.len(), 2);
        assert_eq!(markets[0].slug, "nfl-chiefs");
        assert_eq!(markets[0].yes_price, 65);
        assert_eq!(markets[0].no_price, 35);
        assert_eq!(markets[0].event_slug, "super-bowl-2026");
        assert_eq!(markets[0].yes_token_id.as_deref(), Some("tok-yes"));
        assert_eq!(markets[1].yes_price, 30);
        assert_eq!(markets[1].no_price, 70);
    }

    #[test]
    fn every_market_satisfies_the_price_complement() {
        let events = vec![
            two_outcome_event(),
            make_event(json!({
                "id": "evt-2",
                "slug": "rate-cut-march",
                "title": "Fed cuts rates in March",
                "outcomes": []
            })),
        ];
        let markets = flatten_events(events);
        assert_eq!(markets.len(), 3);
        for market in &markets {
            assert_eq!(market.yes_price + market.no_price, 100, "{}", market.slug);
        }
    }

    #[test]
    fn event_without_outcomes_gets_a_fallback_market() {
        let markets = flatten_events(vec![make_event(json!({
            "id": "evt-2",
            "slug": "rate-cut-march",
            "title": "Fed cuts rates in March",
            "outcomes": []
        }))]);
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].yes_price, 50);
        assert_eq!(markets[0].no_price, 50);
        assert_eq!(markets[0].slug, "rate-cut-march");
        assert!(markets[0].condition_id.is_empty());
    }

    #[test]
    fn rows_missing_identity_fields_are_dropped() {
        // outcome without a slug
        let markets = flatten_events(vec![make_event(json!({
            "id": "evt-1",
            "slug": "some-event",
            "title": "Some event",
            "outcomes": [{"id": "out-1", "yesPrice": 0.5}]
        }))]);
        assert!(markets.is_empty());

        // event without a slug drops everything under it
        let markets = flatten_events(vec![make_event(json!({
            "id": "evt-1",
            "title": "Some event",
            "outcomes": [{"id": "out-1", "slug": "o", "title": "O", "yesPrice": 0.5}]
        }))]);
        assert!(markets.is_empty());
    }

    #[test]
    fn rows_with_invalid_prices_are_dropped() {
        let markets = flatten_events(vec![make_event(json!({
            "id": "evt-1",
            "slug": "some-event",
            "title": "Some event",
            "outcomes": [
                {"id": "out-1", "slug": "bad", "title": "Bad", "yesPrice": 1.5},
                {"id": "out-2", "slug": "good", "title": "Good", "yesPrice": 0.5}
            ]
        }))]);
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].slug, "good");
    }

    #[test]
    fn outcome_title_falls_back_to_event_title() {
        let markets = flatten_events(vec![make_event(json!({
            "id": "evt-1",
            "slug": "some-event",
            "title": "Some event",
            "outcomes": [{"id": "out-1", "slug": "o", "yesPrice": 0.5}]
        }))]);
        assert_eq!(markets[0].title, "Some event");
    }

    #[test]
    fn end_dates_parse_in_both_formats() {
        assert!(parse_end_date("2026-02-08T23:00:00Z").is_some());
        assert!(parse_end_date("2026-02-08").is_some());
        assert!(parse_end_date("next tuesday").is_none());
    }

    // ── catalog container ──────────────────────────────────────────────

    fn make_market(id: &str, slug: &str) -> Market {
        Market {
            id: id.to_string(),
            condition_id: String::new(),
            slug: slug.to_string(),
            event_slug: "evt".to_string(),
            title: slug.to_string(),
            description: None,
            image: None,
            yes_price: 50,
            no_price: 50,
            volume: 0.0,
            volume_24h: 0.0,
            liquidity: 0.0,
            end_date: None,
            yes_token_id: None,
            no_token_id: None,
        }
    }

    #[test]
    fn append_unique_dedups_by_id() {
        let mut catalog = MarketCatalog::new();
        assert_eq!(
            catalog.append_unique(vec![make_market("a", "a"), make_market("b", "b")]),
            2
        );
        // overlapping page: only the new row lands
        assert_eq!(
            catalog.append_unique(vec![make_market("b", "b"), make_market("c", "c")]),
            1
        );
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn selection_survives_appends() {
        let mut catalog = MarketCatalog::new();
        catalog.append_unique(vec![make_market("a", "a"), make_market("b", "b")]);
        assert!(catalog.select_slug("b").is_some());
        catalog.append_unique(vec![make_market("c", "c")]);
        assert_eq!(catalog.selected().unwrap().slug, "b");
    }

    #[test]
    fn unknown_slug_keeps_current_selection() {
        let mut catalog = MarketCatalog::new();
        catalog.append_unique(vec![make_market("a", "a")]);
        catalog.select_slug("a");
        assert!(catalog.select_slug("missing").is_none());
        assert_eq!(catalog.selected().unwrap().slug, "a");
    }
}
