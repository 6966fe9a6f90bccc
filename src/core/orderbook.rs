//! Local order-book replica
//!
//! One replica per symbol, owned by that symbol's synchronizer. Levels live in
//! `BTreeMap`s keyed by price so iteration is always sorted: bids are read out
//! descending, asks ascending. All arithmetic uses `Decimal`.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::adapters::types::{OrderBookView, PriceLevel};

/// Book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

/// In-memory book for a single symbol
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookReplica {
    symbol: String,
    /// price → size, ascending; best bid is the last entry
    bids: BTreeMap<Decimal, Decimal>,
    /// price → size, ascending; best ask is the first entry
    asks: BTreeMap<Decimal, Decimal>,
    sequence: Option<u64>,
    /// Exchange timestamp of the last applied message (Unix ms)
    last_update_ms: u64,
}

impl OrderBookReplica {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: None,
            last_update_ms: 0,
        }
    }

    /// Build a replica from a full snapshot; zero-size levels are skipped
    pub fn from_snapshot(
        symbol: impl Into<String>,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        sequence: Option<u64>,
        timestamp_ms: u64,
    ) -> Self {
        let mut book = Self::new(symbol);
        for level in bids {
            book.apply_level(Side::Bid, level);
        }
        for level in asks {
            book.apply_level(Side::Ask, level);
        }
        book.sequence = sequence;
        book.last_update_ms = timestamp_ms;
        book
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: Option<u64>) {
        self.sequence = sequence;
    }

    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms
    }

    pub fn set_last_update_ms(&mut self, timestamp_ms: u64) {
        self.last_update_ms = timestamp_ms;
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Decimal, Decimal> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    /// Upsert a level, or remove it when the size is zero
    pub fn apply_level(&mut self, side: Side, level: &PriceLevel) {
        let levels = self.side_mut(side);
        // Remove first so the stored key carries the latest price formatting
        levels.remove(&level.price);
        if !level.size.is_zero() {
            levels.insert(level.price, level.size);
        }
    }

    /// Apply one delta batch
    pub fn apply_levels(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        for level in bids {
            self.apply_level(Side::Bid, level);
        }
        for level in asks {
            self.apply_level(Side::Ask, level);
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(price, size)| PriceLevel { price: *price, size: *size })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(price, size)| PriceLevel { price: *price, size: *size })
    }

    /// Best bid at or above best ask
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Bids, best first
    pub fn bids(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.bids
            .iter()
            .rev()
            .map(|(price, size)| PriceLevel { price: *price, size: *size })
    }

    /// Asks, best first
    pub fn asks(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.asks
            .iter()
            .map(|(price, size)| PriceLevel { price: *price, size: *size })
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Drop levels beyond `max_depth` on each side
    pub fn trim(&mut self, max_depth: usize) {
        while self.bids.len() > max_depth {
            self.bids.pop_first();
        }
        while self.asks.len() > max_depth {
            self.asks.pop_last();
        }
    }

    /// Immutable reader copy
    pub fn view(&self, is_stale: bool) -> OrderBookView {
        OrderBookView {
            symbol: self.symbol.clone(),
            bids: self.bids().collect(),
            asks: self.asks().collect(),
            sequence: self.sequence,
            timestamp: self.last_update_ms,
            is_stale,
        }
    }
}
