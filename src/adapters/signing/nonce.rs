//! Per-credential nonce counter
//!
//! Exchanges with replay protection reject any nonce that is not strictly
//! greater than the previous one for the same key. The counter tracks wall
//! time so a restarted process still issues nonces above the last run's.

use std::sync::atomic::{AtomicU64, Ordering};

/// Strictly increasing nonce source owned by one signer
#[derive(Debug, Default)]
pub struct NonceCounter {
    last: AtomicU64,
}

impl NonceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next nonce: `max(last + 1, now_ms)`
    pub fn next(&self, now_ms: u64) -> u64 {
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|current| current);
        now_ms.max(previous.saturating_add(1))
    }

    /// Last nonce issued (0 if none)
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
