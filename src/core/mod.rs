//! Core module - rate limiting, dispatch, order-book replication
//!
//! This module uses **explicit re-exports** instead of glob exports (`pub use module::*`)
//! to provide better API visibility and prevent accidental public API changes.
//!
//! ## Usage
//! Prefer importing from `crate::core`:
//! ```ignore
//! use crate::core::{ExchangeClient, OrderBookSynchronizer, RateLimiter};
//! ```

pub mod checksum;
pub mod client;
pub mod dispatcher;
pub mod feed;
pub mod orderbook;
pub mod rate_limit;
pub mod sync;
pub mod weights;

// Explicit re-exports for rate_limit module
pub use rate_limit::{RateLimitBucket, RateLimiter};

// Explicit re-exports for dispatch pipeline
pub use dispatcher::Dispatcher;
pub use weights::{endpoint_cost, EndpointTable, RequestCost};
pub use client::ExchangeClient;

// Explicit re-exports for order-book engine
pub use checksum::{book_checksum, checksum_matches, checksum_payload, DEFAULT_CHECKSUM_DEPTH};
pub use orderbook::{OrderBookReplica, Side};
pub use sync::{
    ApplyOutcome, BookMessage, BookMessageKind, ContinuityMode, DesyncReason, OrderBookSynchronizer,
    SyncConfig, SyncState, SyncStats,
};
pub use feed::{
    parse_message, spawn_feed_consumer, BookRegistry, FeedStats, ResyncRequest,
    RESYNC_CHANNEL_CAPACITY,
};
