//! Feed session: one owner for catalog, ledger, book, and stream state with
//! an explicit start/stop lifecycle.
//!
//! The state core is synchronous; network I/O lives in the runtime shell,
//! which executes the [`Followup`]s each transition returns. Snapshot polling
//! and the live push stream are two producers feeding the same ledger merge
//! path.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::book::Orderbook;
use crate::catalog::{CatalogClient, MarketCatalog};
use crate::config::AppConfig;
use crate::ledger::{FlowStats, TradeLedger};
use crate::snapshot::{RequestGuard, SnapshotClient};
use crate::stream::{StreamConfig, StreamEvent, StreamHandle};
use crate::types::{ConnectionStatus, FeedStatus, Market, Trade, TradeFilter};

/// Cadence of the periodic health log line.
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Mode flags resolved from the command line.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Follow one market by slug; must exist in the initial catalog page.
    pub market_slug: Option<String>,
    /// Stream every market instead of a single selection.
    pub follow_all: bool,
    /// Keep only trades at or above the whale floor.
    pub whale_only: bool,
    /// Override for the configured whale floor, in USD notional.
    pub whale_min_usd: Option<f64>,
}

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum FeedCommand {
    SelectMarket(String),
    LoadMore,
    FollowAll,
    Reconnect,
    Stop,
}

/// One reportable occurrence, emitted on the session event channel and
/// serialized by the reporter as a JSON line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    SessionStarted {
        markets: usize,
        selected: Option<String>,
    },
    MarketSelected {
        slug: String,
        title: String,
        yes_price: i64,
        no_price: i64,
    },
    CatalogExtended {
        added: usize,
        total: usize,
    },
    TradeMerged {
        trade: Trade,
        stats: FlowStats,
    },
    SnapshotApplied {
        slug: String,
        seeded_trades: usize,
        bid_levels: usize,
        ask_levels: usize,
        spread: Option<f64>,
        mid_price: Option<f64>,
    },
    StatusChanged {
        status: ConnectionStatus,
        attempts: u32,
    },
    Subscribed {
        subscription_id: String,
    },
    Error {
        message: String,
        terminal: bool,
    },
}

/// Printed once at shutdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSummary {
    pub selected_market: Option<String>,
    pub markets_loaded: usize,
    pub uptime_secs: u64,
    pub messages_received: u64,
    pub trades_merged: u64,
    pub duplicates_dropped: u64,
    pub trades_filtered_out: u64,
    pub snapshots_applied: u64,
    pub stale_responses_dropped: u64,
    pub reconnects: u32,
    pub stats: FlowStats,
}

/// Deferred side effect decided by the state core and executed by the
/// runtime shell.
#[derive(Debug)]
enum Followup {
    Emit(FeedEvent),
    Subscribe(TradeFilter),
    FetchSnapshot { request_id: u64, market: Market },
    FetchPage { offset: usize },
}

/// Completed snapshot fetch, tagged with the request id it was issued under.
struct SnapshotResult {
    request_id: u64,
    market: Market,
    outcome: Result<(Option<Orderbook>, Vec<Trade>)>,
}

struct SessionState {
    catalog: MarketCatalog,
    ledger: TradeLedger,
    orderbook: Option<Orderbook>,
    status: FeedStatus,
    guard: RequestGuard,
    started_at: Instant,
    /// Seed-once marker; cleared on every selection change.
    last_seeded_slug: Option<String>,
    follow_all: bool,
    whale_min_usd: f64,
    page_size: usize,
    catalog_offset: usize,
    /// Queued page requests beyond the one in flight.
    pending_pages: u32,
    page_in_flight: bool,
    /// Set on exhaustion; only a manual reconnect clears the error then.
    terminal_error: bool,
    ever_connected: bool,
    reconnects: u32,
    filtered_out: u64,
    snapshots_applied: u64,
    stale_dropped: u64,
}

impl SessionState {
    fn new(
        catalog: MarketCatalog,
        ledger: TradeLedger,
        whale_min_usd: f64,
        page_size: usize,
        follow_all: bool,
    ) -> Self {
        let mut status = FeedStatus::new();
        status.selected_slug = catalog.selected().map(|m| m.slug.clone());
        Self {
            catalog,
            ledger,
            orderbook: None,
            status,
            guard: RequestGuard::new(),
            started_at: Instant::now(),
            last_seeded_slug: None,
            follow_all,
            whale_min_usd,
            page_size,
            catalog_offset: page_size,
            pending_pages: 0,
            page_in_flight: false,
            terminal_error: false,
            ever_connected: false,
            reconnects: 0,
            filtered_out: 0,
            snapshots_applied: 0,
            stale_dropped: 0,
        }
    }

    fn current_filter(&self) -> TradeFilter {
        if self.follow_all {
            return TradeFilter::All;
        }
        match self.catalog.selected() {
            Some(market) => TradeFilter::for_market(market),
            None => TradeFilter::All,
        }
    }

    fn startup_followups(&mut self) -> Vec<Followup> {
        let mut followups = vec![Followup::Emit(FeedEvent::SessionStarted {
            markets: self.catalog.len(),
            selected: self.status.selected_slug.clone(),
        })];
        if let Some(market) = self.catalog.selected().cloned() {
            let request_id = self.guard.issue();
            followups.push(Followup::FetchSnapshot { request_id, market });
        }
        followups
    }

    /// Switch the selected market. The ledger and book are cleared before
    /// anything for the new market arrives, and an immediate snapshot is
    /// issued so the reseed does not wait for the next poll tick.
    fn select_market(&mut self, slug: &str) -> Vec<Followup> {
        if self.status.selected_slug.as_deref() == Some(slug) {
            return Vec::new();
        }
        let Some(market) = self.catalog.select_slug(slug) else {
            return self.record_error(format!("unknown market slug: {slug}"));
        };
        let market = market.clone();
        info!("Selected market {} ({})", market.slug, market.title);

        self.ledger.clear();
        self.orderbook = None;
        self.last_seeded_slug = None;
        self.follow_all = false;
        self.status.selected_slug = Some(market.slug.clone());

        let request_id = self.guard.issue();
        vec![
            Followup::Emit(FeedEvent::MarketSelected {
                slug: market.slug.clone(),
                title: market.title.clone(),
                yes_price: market.yes_price,
                no_price: market.no_price,
            }),
            Followup::Subscribe(TradeFilter::for_market(&market)),
            Followup::FetchSnapshot { request_id, market },
        ]
    }

    /// Widen the stream to every market. The ledger is cleared so the view
    /// never mixes a single-market backlog into the firehose; the selected
    /// market keeps its book polling.
    fn follow_all_markets(&mut self) -> Vec<Followup> {
        if self.follow_all {
            return Vec::new();
        }
        info!("Following all markets");
        self.follow_all = true;
        self.ledger.clear();
        vec![Followup::Subscribe(TradeFilter::All)]
    }

    /// Queue a catalog page request. Fetches run one at a time, so queued
    /// requests load consecutive pages instead of hitting the same offset
    /// twice.
    fn request_page(&mut self) -> Vec<Followup> {
        self.pending_pages += 1;
        self.next_page_fetch()
    }

    fn next_page_fetch(&mut self) -> Vec<Followup> {
        if self.page_in_flight || self.pending_pages == 0 {
            return Vec::new();
        }
        self.page_in_flight = true;
        vec![Followup::FetchPage {
            offset: self.catalog_offset,
        }]
    }

    /// Merge one completed page fetch and start the next queued one. The
    /// offset only advances on success, so a failed page is retried by the
    /// next queued request.
    fn apply_page(&mut self, result: Result<Vec<Market>>) -> Vec<Followup> {
        self.page_in_flight = false;
        self.pending_pages = self.pending_pages.saturating_sub(1);
        let mut followups = match result {
            Ok(markets) => self.extend_catalog(markets),
            Err(e) => self.record_error(format!("catalog page failed: {e}")),
        };
        followups.extend(self.next_page_fetch());
        followups
    }

    fn extend_catalog(&mut self, markets: Vec<Market>) -> Vec<Followup> {
        let added = self.catalog.append_unique(markets);
        self.catalog_offset += self.page_size;
        info!(
            "Catalog extended by {added} market(s), {} total",
            self.catalog.len()
        );
        vec![Followup::Emit(FeedEvent::CatalogExtended {
            added,
            total: self.catalog.len(),
        })]
    }

    fn poll_tick(&mut self) -> Vec<Followup> {
        let Some(market) = self.catalog.selected().cloned() else {
            return Vec::new();
        };
        let request_id = self.guard.issue();
        vec![Followup::FetchSnapshot { request_id, market }]
    }

    fn on_stream_event(&mut self, event: StreamEvent) -> Vec<Followup> {
        match event {
            StreamEvent::Status { status, attempts } => {
                // The task re-announces its status around backoff waits.
                if self.status.status == status && self.status.reconnect_attempts == attempts {
                    return Vec::new();
                }
                if status == ConnectionStatus::Connected {
                    if self.ever_connected {
                        self.reconnects += 1;
                    }
                    self.ever_connected = true;
                    self.terminal_error = false;
                    self.status.last_error = None;
                } else {
                    self.status.subscription_id = None;
                }
                self.status.status = status;
                self.status.reconnect_attempts = attempts;
                vec![Followup::Emit(FeedEvent::StatusChanged { status, attempts })]
            }
            StreamEvent::Subscribed { subscription_id } => {
                self.touch();
                self.status.subscription_id = Some(subscription_id.clone());
                vec![Followup::Emit(FeedEvent::Subscribed { subscription_id })]
            }
            StreamEvent::Trade(trade) => {
                self.touch();
                if !self.admits(&trade) {
                    self.filtered_out += 1;
                    return Vec::new();
                }
                if self.ledger.insert(trade.clone()) {
                    let stats = self.stats();
                    vec![Followup::Emit(FeedEvent::TradeMerged { trade, stats })]
                } else {
                    Vec::new()
                }
            }
            StreamEvent::StreamError(message) => {
                self.record_error(format!("stream error: {message}"))
            }
            StreamEvent::Exhausted => {
                let message =
                    "reconnect attempts exhausted; waiting for a manual reconnect".to_string();
                warn!("{message}");
                self.terminal_error = true;
                self.status.last_error = Some(message.clone());
                vec![Followup::Emit(FeedEvent::Error {
                    message,
                    terminal: true,
                })]
            }
            StreamEvent::Heartbeat => {
                self.touch();
                Vec::new()
            }
        }
    }

    /// Merge one completed snapshot fetch. A response issued under a request
    /// id older than the newest one is dropped without touching any state,
    /// and a response that carried no data leaves the seed pending and the
    /// previous book current.
    fn apply_snapshot(&mut self, result: SnapshotResult) -> Vec<Followup> {
        if !self.guard.admit(result.request_id) {
            self.stale_dropped += 1;
            debug!(
                "discarding stale snapshot for {} (request {})",
                result.market.slug, result.request_id
            );
            return Vec::new();
        }
        match result.outcome {
            Err(e) => self.record_error(format!("snapshot fetch failed: {e}")),
            Ok((book, trades)) => {
                if !self.terminal_error {
                    self.status.last_error = None;
                }
                // A body that parsed to nothing is a skipped cycle, not an
                // apply.
                if book.is_none() && trades.is_empty() {
                    debug!("snapshot carried no data for {}", result.market.slug);
                    return Vec::new();
                }
                self.snapshots_applied += 1;
                let seeded = if !self.follow_all
                    && self.last_seeded_slug.as_deref() != Some(result.market.slug.as_str())
                {
                    let count = self.ledger.seed(trades);
                    self.last_seeded_slug = Some(result.market.slug.clone());
                    count
                } else {
                    0
                };
                let (bid_levels, ask_levels, spread, mid_price) = match &book {
                    Some(book) => (
                        book.yes_bids.len(),
                        book.yes_asks.len(),
                        book.spread(),
                        Some(book.mid_price(result.market.yes_price)),
                    ),
                    None => (0, 0, None, None),
                };
                if book.is_some() {
                    self.orderbook = book;
                }
                vec![Followup::Emit(FeedEvent::SnapshotApplied {
                    slug: result.market.slug,
                    seeded_trades: seeded,
                    bid_levels,
                    ask_levels,
                    spread,
                    mid_price,
                })]
            }
        }
    }

    fn manual_reconnect(&mut self) {
        info!("Manual reconnect: clearing error state");
        self.terminal_error = false;
        self.status.last_error = None;
        self.status.reconnect_attempts = 0;
    }

    /// Local guard against a stale subscription still delivering events for
    /// a previously selected market.
    fn admits(&self, trade: &Trade) -> bool {
        if self.follow_all {
            return true;
        }
        match self.catalog.selected() {
            Some(market) => market.matches_trade(trade),
            None => true,
        }
    }

    fn record_error(&mut self, message: String) -> Vec<Followup> {
        warn!("{message}");
        self.status.last_error = Some(message.clone());
        vec![Followup::Emit(FeedEvent::Error {
            message,
            terminal: false,
        })]
    }

    fn touch(&mut self) {
        self.status.last_message_at = Some(Utc::now());
        self.status.message_count += 1;
    }

    fn stats(&self) -> FlowStats {
        FlowStats::compute(self.ledger.trades(), self.whale_min_usd)
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            selected_market: self.status.selected_slug.clone(),
            markets_loaded: self.catalog.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            messages_received: self.status.message_count,
            trades_merged: self.ledger.inserted(),
            duplicates_dropped: self.ledger.dedup_hits(),
            trades_filtered_out: self.filtered_out,
            snapshots_applied: self.snapshots_applied,
            stale_responses_dropped: self.stale_dropped,
            reconnects: self.reconnects,
            stats: self.stats(),
        }
    }
}

/// Running feed session. Commands are fire-and-forget; events arrive on
/// [`FeedSession::next_event`] and health on the status watch channel.
pub struct FeedSession {
    commands: mpsc::UnboundedSender<FeedCommand>,
    events: mpsc::UnboundedReceiver<FeedEvent>,
    status: watch::Receiver<FeedStatus>,
    task: JoinHandle<SessionSummary>,
}

impl FeedSession {
    /// Load the initial catalog page, open the stream, and spawn the
    /// session runtime.
    pub async fn start(config: AppConfig, options: SessionOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        let catalog_client = CatalogClient::new(http.clone(), &config)?;
        let snapshot_client = SnapshotClient::new(http, &config)?;
        let stream_config = StreamConfig::from_app(&config)?;

        info!("Loading market catalog...");
        let initial = catalog_client
            .fetch_events(0)
            .await
            .context("initial catalog load failed")?;
        let mut catalog = MarketCatalog::new();
        let added = catalog.append_unique(initial);
        info!("Loaded {added} market(s)");

        if let Some(slug) = &options.market_slug {
            if catalog.select_slug(slug).is_none() {
                bail!("market slug not found in catalog: {slug}");
            }
        } else if !options.follow_all {
            if let Some(slug) = catalog.first_slug().map(str::to_string) {
                catalog.select_slug(&slug);
                info!("Auto-selected market {slug}");
            }
        }

        let whale_min_usd = options.whale_min_usd.unwrap_or(config.feed.whale_min_usd);
        let ledger = if options.whale_only {
            TradeLedger::whale_only(config.feed.whale_ledger_capacity, whale_min_usd)
        } else {
            TradeLedger::new(config.feed.ledger_capacity)
        };

        let mut state = SessionState::new(
            catalog,
            ledger,
            whale_min_usd,
            config.feed.page_size,
            options.follow_all,
        );

        let (stream, stream_events) = StreamHandle::spawn(stream_config, state.current_filter());

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (page_tx, page_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(state.status.clone());

        let startup = state.startup_followups();
        apply(
            startup,
            &stream,
            &catalog_client,
            &snapshot_client,
            &results_tx,
            &page_tx,
            &event_tx,
        );

        let runtime = SessionRuntime {
            state,
            catalog_client,
            snapshot_client,
            stream,
            stream_events,
            commands: command_rx,
            events: event_tx,
            status_tx,
            snapshot_results: results_rx,
            snapshot_results_tx: results_tx,
            page_results: page_rx,
            page_results_tx: page_tx,
            poll_interval: config.feed.poll_interval(),
            stale_threshold: config.feed.stale_threshold(),
        };
        let task = tokio::spawn(runtime.run());

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            status: status_rx,
            task,
        })
    }

    /// Next reportable event; `None` once the session has stopped.
    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.status.clone()
    }

    pub fn select_market(&self, slug: &str) {
        let _ = self
            .commands
            .send(FeedCommand::SelectMarket(slug.to_string()));
    }

    /// Fetch and append the next catalog page.
    pub fn load_more(&self) {
        let _ = self.commands.send(FeedCommand::LoadMore);
    }

    /// Reset the attempt counter and force a reconnect; also clears a
    /// terminal error left by an exhausted retry run.
    pub fn reconnect(&self) {
        let _ = self.commands.send(FeedCommand::Reconnect);
    }

    pub fn follow_all(&self) {
        let _ = self.commands.send(FeedCommand::FollowAll);
    }

    /// Stop the session and collect the exit summary.
    pub async fn stop(self) -> SessionSummary {
        let _ = self.commands.send(FeedCommand::Stop);
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("session task failed: {e}");
                SessionSummary::default()
            }
        }
    }
}

struct SessionRuntime {
    state: SessionState,
    catalog_client: CatalogClient,
    snapshot_client: SnapshotClient,
    stream: StreamHandle,
    stream_events: mpsc::UnboundedReceiver<StreamEvent>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    events: mpsc::UnboundedSender<FeedEvent>,
    status_tx: watch::Sender<FeedStatus>,
    snapshot_results: mpsc::UnboundedReceiver<SnapshotResult>,
    snapshot_results_tx: mpsc::UnboundedSender<SnapshotResult>,
    page_results: mpsc::UnboundedReceiver<Result<Vec<Market>>>,
    page_results_tx: mpsc::UnboundedSender<Result<Vec<Market>>>,
    poll_interval: Duration,
    stale_threshold: Duration,
}

impl SessionRuntime {
    async fn run(self) -> SessionSummary {
        let SessionRuntime {
            mut state,
            catalog_client,
            snapshot_client,
            stream,
            mut stream_events,
            mut commands,
            events,
            status_tx,
            mut snapshot_results,
            snapshot_results_tx,
            mut page_results,
            page_results_tx,
            poll_interval,
            stale_threshold,
        } = self;

        let mut poll =
            tokio::time::interval_at(tokio::time::Instant::now() + poll_interval, poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health = tokio::time::interval(HEALTH_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        health.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(FeedCommand::SelectMarket(slug)) => {
                        let followups = state.select_market(&slug);
                        apply(followups, &stream, &catalog_client, &snapshot_client, &snapshot_results_tx, &page_results_tx, &events);
                    }
                    Some(FeedCommand::LoadMore) => {
                        let followups = state.request_page();
                        apply(followups, &stream, &catalog_client, &snapshot_client, &snapshot_results_tx, &page_results_tx, &events);
                    }
                    Some(FeedCommand::FollowAll) => {
                        let followups = state.follow_all_markets();
                        apply(followups, &stream, &catalog_client, &snapshot_client, &snapshot_results_tx, &page_results_tx, &events);
                    }
                    Some(FeedCommand::Reconnect) => {
                        state.manual_reconnect();
                        stream.reconnect();
                    }
                    Some(FeedCommand::Stop) | None => break,
                },
                Some(event) = stream_events.recv() => {
                    let followups = state.on_stream_event(event);
                    apply(followups, &stream, &catalog_client, &snapshot_client, &snapshot_results_tx, &page_results_tx, &events);
                },
                Some(result) = snapshot_results.recv() => {
                    let followups = state.apply_snapshot(result);
                    apply(followups, &stream, &catalog_client, &snapshot_client, &snapshot_results_tx, &page_results_tx, &events);
                },
                Some(result) = page_results.recv() => {
                    let followups = state.apply_page(result);
                    apply(followups, &stream, &catalog_client, &snapshot_client, &snapshot_results_tx, &page_results_tx, &events);
                },
                _ = poll.tick() => {
                    let followups = state.poll_tick();
                    apply(followups, &stream, &catalog_client, &snapshot_client, &snapshot_results_tx, &page_results_tx, &events);
                },
                _ = health.tick() => log_health(&state, stale_threshold),
            }
            status_tx.send_replace(state.status.clone());
        }

        stream.shutdown().await;
        state.status.status = ConnectionStatus::Disconnected;
        status_tx.send_replace(state.status.clone());
        state.summary()
    }
}

fn apply(
    followups: Vec<Followup>,
    stream: &StreamHandle,
    catalog_client: &CatalogClient,
    snapshot_client: &SnapshotClient,
    snapshot_results: &mpsc::UnboundedSender<SnapshotResult>,
    page_results: &mpsc::UnboundedSender<Result<Vec<Market>>>,
    events: &mpsc::UnboundedSender<FeedEvent>,
) {
    for followup in followups {
        match followup {
            Followup::Emit(event) => {
                let _ = events.send(event);
            }
            Followup::Subscribe(filter) => stream.set_filter(filter),
            Followup::FetchSnapshot { request_id, market } => {
                let client = snapshot_client.clone();
                let results = snapshot_results.clone();
                tokio::spawn(async move {
                    let outcome = client.fetch(&market).await;
                    let _ = results.send(SnapshotResult {
                        request_id,
                        market,
                        outcome,
                    });
                });
            }
            Followup::FetchPage { offset } => {
                let client = catalog_client.clone();
                let results = page_results.clone();
                tokio::spawn(async move {
                    let _ = results.send(client.fetch_events(offset).await);
                });
            }
        }
    }
}

fn log_health(state: &SessionState, stale_threshold: Duration) {
    let status = &state.status;
    if status.is_stale(stale_threshold) {
        warn!(
            "Feed stale: status={:?} messages={} last_error={:?}",
            status.status, status.message_count, status.last_error
        );
    } else {
        let stats = state.stats();
        info!(
            "Feed healthy: messages={} ledger={} net_flow={:.2}",
            status.message_count,
            state.ledger.len(),
            stats.net_flow
        );
    }
}
