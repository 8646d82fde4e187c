//! Capped, deduplicated, newest-first trade ledger plus the flow stats
//! derived from it.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;

use crate::types::{Trade, TradeSide};

/// In-memory trade ledger. Both producers (the snapshot seed and the live
/// push stream) go through [`TradeLedger::insert`], the single merge point
/// that enforces the dedup and capacity invariants.
#[derive(Debug)]
pub struct TradeLedger {
    trades: VecDeque<Trade>,
    seen: HashSet<String>,
    capacity: usize,
    whale_min_usd: Option<f64>,
    inserted: u64,
    dedup_hits: u64,
}

impl TradeLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            trades: VecDeque::with_capacity(capacity),
            seen: HashSet::new(),
            capacity,
            whale_min_usd: None,
            inserted: 0,
            dedup_hits: 0,
        }
    }

    /// Whale-only mode: inserts below the notional threshold are dropped.
    pub fn whale_only(capacity: usize, min_usd: f64) -> Self {
        Self {
            whale_min_usd: Some(min_usd),
            ..Self::new(capacity)
        }
    }

    /// Insert at the head unless the id is already present, evicting from
    /// the tail once over capacity. Returns whether the trade was accepted.
    pub fn insert(&mut self, trade: Trade) -> bool {
        if let Some(min_usd) = self.whale_min_usd {
            if !trade.is_whale(min_usd) {
                return false;
            }
        }
        if self.seen.contains(&trade.id) {
            self.dedup_hits += 1;
            return false;
        }
        self.seen.insert(trade.id.clone());
        self.trades.push_front(trade);
        while self.trades.len() > self.capacity {
            if let Some(evicted) = self.trades.pop_back() {
                self.seen.remove(&evicted.id);
            }
        }
        self.inserted += 1;
        true
    }

    /// Seed from a snapshot's recent trades (newest first). Replayed oldest
    /// first so the head of the ledger stays the most recent trade.
    pub fn seed(&mut self, trades: Vec<Trade>) -> usize {
        let mut accepted = 0;
        for trade in trades.into_iter().rev() {
            if self.insert(trade) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Drop all entries. Lifetime counters survive for the exit summary.
    pub fn clear(&mut self) {
        self.trades.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest first.
    pub fn trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn dedup_hits(&self) -> u64 {
        self.dedup_hits
    }
}

/// Aggregate buy/sell flow over the current ledger contents. Recomputed in
/// full on every ledger change; the bounded capacity keeps that cheap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FlowStats {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub net_flow: f64,
    pub buy_count: u64,
    pub sell_count: u64,
    pub whale_count: u64,
    pub last_trade_at: Option<i64>,
}

impl FlowStats {
    pub fn compute<'a, I>(trades: I, whale_min_usd: f64) -> Self
    where
        I: IntoIterator<Item = &'a Trade>,
    {
        let mut stats = Self::default();
        for trade in trades {
            let notional = trade.notional();
            match trade.side {
                TradeSide::Buy => {
                    stats.buy_volume += notional;
                    stats.buy_count += 1;
                }
                TradeSide::Sell => {
                    stats.sell_volume += notional;
                    stats.sell_count += 1;
                }
            }
            if trade.is_whale(whale_min_usd) {
                stats.whale_count += 1;
            }
            stats.last_trade_at = Some(
                stats
                    .last_trade_at
                    .map_or(trade.timestamp, |t| t.max(trade.timestamp)),
            );
        }
        stats.net_flow = stats.buy_volume - stats.sell_volume;
        stats
    }
}
