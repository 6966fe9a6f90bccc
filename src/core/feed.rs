//! Book registry and stream consumer
//!
//! `BookRegistry` owns one synchronizer per symbol. The streaming
//! collaborator pushes raw JSON into an `mpsc` channel; a single consumer
//! task parses and applies messages in arrival order. Readers call
//! `get_order_book` from any task and receive an immutable copy.
//!
//! Desyncs (and the first delta that arrives before any snapshot) are
//! published as `ResyncRequest`s so the collaborator can fetch a snapshot or
//! resubscribe.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::types::{decimal_from_json, OrderBookView, PriceLevel};
use crate::core::sync::{
    ApplyOutcome, BookMessage, BookMessageKind, OrderBookSynchronizer, SyncConfig, SyncState,
    SyncStats,
};

/// Capacity of the resync broadcast channel
pub const RESYNC_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Message Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawBookMessage {
    #[serde(rename = "type")]
    kind: BookMessageKind,
    symbol: String,
    #[serde(default)]
    bids: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    asks: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    sequence: Option<u64>,
    #[serde(default)]
    first_sequence: Option<u64>,
    #[serde(default)]
    previous_sequence: Option<u64>,
    #[serde(default)]
    checksum: Option<i64>,
    #[serde(default)]
    timestamp: u64,
}

/// Levels are taken as published; negative sizes are left for the
/// synchronizer to reject so they count as a desync.
fn parse_levels(raw: &[Vec<serde_json::Value>]) -> ExchangeResult<Vec<PriceLevel>> {
    raw.iter()
        .map(|entry| {
            if entry.len() < 2 {
                return Err(ExchangeError::InvalidResponse(format!(
                    "price level needs [price, size], got {} elements",
                    entry.len()
                )));
            }
            Ok(PriceLevel {
                price: decimal_from_json(&entry[0])?,
                size: decimal_from_json(&entry[1])?,
            })
        })
        .collect()
}

/// Parse one normalized book message
pub fn parse_message(raw: &str) -> ExchangeResult<BookMessage> {
    let msg: RawBookMessage = serde_json::from_str(raw)
        .map_err(|e| ExchangeError::InvalidResponse(format!("Malformed book message: {}", e)))?;
    if msg.symbol.is_empty() {
        return Err(ExchangeError::InvalidResponse(
            "Book message has an empty symbol".to_string(),
        ));
    }
    Ok(BookMessage {
        kind: msg.kind,
        bids: parse_levels(&msg.bids)?,
        asks: parse_levels(&msg.asks)?,
        symbol: msg.symbol,
        sequence: msg.sequence,
        first_sequence: msg.first_sequence,
        previous_sequence: msg.previous_sequence,
        checksum: msg.checksum,
        timestamp: msg.timestamp,
    })
}

// =============================================================================
// Registry
// =============================================================================

/// Request for a fresh snapshot of one symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub symbol: String,
    pub reason: String,
}

/// All books of one exchange client
#[derive(Debug)]
pub struct BookRegistry {
    exchange: String,
    config: SyncConfig,
    books: RwLock<HashMap<String, Arc<Mutex<OrderBookSynchronizer>>>>,
    resync_tx: broadcast::Sender<ResyncRequest>,
}

impl BookRegistry {
    pub fn new(exchange: impl Into<String>, config: SyncConfig) -> Self {
        let (resync_tx, _) = broadcast::channel(RESYNC_CHANNEL_CAPACITY);
        Self {
            exchange: exchange.into(),
            config,
            books: RwLock::new(HashMap::new()),
            resync_tx,
        }
    }

    pub fn subscribe_resync(&self) -> broadcast::Receiver<ResyncRequest> {
        self.resync_tx.subscribe()
    }

    fn existing(&self, symbol: &str) -> Option<Arc<Mutex<OrderBookSynchronizer>>> {
        self.books.read().get(symbol).cloned()
    }

    fn book(&self, symbol: &str) -> Arc<Mutex<OrderBookSynchronizer>> {
        if let Some(book) = self.existing(symbol) {
            return book;
        }
        let mut books = self.books.write();
        Arc::clone(books.entry(symbol.to_string()).or_insert_with(|| {
            tracing::debug!(exchange = %self.exchange, symbol, "Tracking new book");
            Arc::new(Mutex::new(OrderBookSynchronizer::new(symbol, self.config.clone())))
        }))
    }

    /// Apply one parsed message to its symbol's book
    pub fn apply(&self, message: BookMessage) -> ApplyOutcome {
        let symbol = message.symbol.clone();
        let book = self.book(&symbol);
        let (outcome, buffered) = {
            let mut sync = book.lock();
            let outcome = sync.apply(message);
            (outcome, sync.buffered_len())
        };

        let reason = match &outcome {
            ApplyOutcome::Desynced(reason) => Some(reason.to_string()),
            ApplyOutcome::Buffered if buffered == 1 => Some("awaiting snapshot".to_string()),
            _ => None,
        };
        if let Some(reason) = reason {
            tracing::info!(exchange = %self.exchange, symbol = %symbol, %reason, "Requesting resync");
            // No subscribers is fine: nobody to notify
            let _ = self.resync_tx.send(ResyncRequest { symbol, reason });
        }
        outcome
    }

    /// Parse and apply a raw JSON message
    pub fn apply_raw(&self, raw: &str) -> ExchangeResult<ApplyOutcome> {
        Ok(self.apply(parse_message(raw)?))
    }

    /// Reader copy of a book; `None` for symbols never seen
    pub fn get_order_book(&self, symbol: &str) -> Option<OrderBookView> {
        self.existing(symbol).map(|book| book.lock().view())
    }

    pub fn state(&self, symbol: &str) -> Option<SyncState> {
        self.existing(symbol).map(|book| book.lock().state())
    }

    pub fn stats(&self, symbol: &str) -> Option<SyncStats> {
        self.existing(symbol).map(|book| book.lock().stats())
    }

    /// Return a book to `Uninitialized`; false for unknown symbols
    pub fn reset(&self, symbol: &str) -> bool {
        match self.existing(symbol) {
            Some(book) => {
                book.lock().reset();
                true
            }
            None => false,
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.books.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

// =============================================================================
// Consumer Task
// =============================================================================

/// Counters returned when the consumer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub received: u64,
    pub applied: u64,
    pub malformed: u64,
    pub desyncs: u64,
}

/// Drain raw messages into the registry until the channel closes or `cancel` fires
pub fn spawn_feed_consumer(
    registry: Arc<BookRegistry>,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> JoinHandle<FeedStats> {
    tokio::spawn(async move {
        let mut stats = FeedStats::default();
        loop {
            let raw = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(exchange = %registry.exchange, "Feed consumer cancelled");
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(raw) => raw,
                    None => {
                        tracing::info!(exchange = %registry.exchange, "Feed channel closed");
                        break;
                    }
                },
            };

            stats.received += 1;
            match registry.apply_raw(&raw) {
                Ok(ApplyOutcome::Desynced(_)) => stats.desyncs += 1,
                Ok(ApplyOutcome::Initialized { .. } | ApplyOutcome::Applied { .. }) => {
                    stats.applied += 1
                }
                Ok(_) => {}
                Err(e) => {
                    stats.malformed += 1;
                    tracing::warn!(exchange = %registry.exchange, error = %e, "Skipping malformed book message");
                }
            }
        }
        stats
    })
}
