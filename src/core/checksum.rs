//! CRC32 book checksum
//!
//! Feeds that publish a checksum instead of (or next to) a sequence number
//! hash the top N levels interleaved as `bidPx:bidSz:askPx:askSz:...`. When
//! one side is shorter the remaining levels of the other side are still
//! included. Exchanges publish the result as either a signed or an unsigned
//! 32-bit integer, so both readings are accepted.

use crate::core::orderbook::OrderBookReplica;

/// Levels per side hashed when the profile does not say otherwise
pub const DEFAULT_CHECKSUM_DEPTH: usize = 25;

/// Canonical string hashed for the checksum
pub fn checksum_payload(book: &OrderBookReplica, depth: usize) -> String {
    let bids: Vec<_> = book.bids().take(depth).collect();
    let asks: Vec<_> = book.asks().take(depth).collect();

    let mut parts: Vec<String> = Vec::with_capacity((bids.len() + asks.len()) * 2);
    for i in 0..bids.len().max(asks.len()) {
        if let Some(bid) = bids.get(i) {
            parts.push(bid.price.to_string());
            parts.push(bid.size.to_string());
        }
        if let Some(ask) = asks.get(i) {
            parts.push(ask.price.to_string());
            parts.push(ask.size.to_string());
        }
    }
    parts.join(":")
}

/// Unsigned CRC32 of the top `depth` levels
pub fn book_checksum(book: &OrderBookReplica, depth: usize) -> u32 {
    crc32fast::hash(checksum_payload(book, depth).as_bytes())
}

/// Compare a published checksum against a computed one
pub fn checksum_matches(published: i64, computed: u32) -> bool {
    published == computed as i64 || published == (computed as i32) as i64
}
