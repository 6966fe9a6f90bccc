//! Per-endpoint token-bucket rate limiting
//!
//! One `RateLimiter` per exchange client, one bucket per weight class.
//! Refill is lazy (computed on access from elapsed time), so an idle limiter
//! costs nothing. Waiters on a bucket queue on a fair async mutex and the
//! head of the queue sleeps while holding it, which serves callers in arrival
//! order and makes over-granting impossible. Each bucket admits at most
//! `max_queue` callers at once; the rest fail fast with `RateLimitExceeded`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::adapters::errors::{ExchangeError, ExchangeResult};

/// Tolerance for floating-point token arithmetic
const TOKEN_EPSILON: f64 = 1e-9;

/// Callers allowed on one bucket unless configured otherwise
pub const DEFAULT_MAX_QUEUE: usize = 1000;

/// Token bucket state for one weight class
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimitBucket {
    /// New bucket, initially full
    pub fn new(capacity: f64, refill_per_ms: f64) -> Self {
        Self {
            capacity,
            refill_per_ms,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = f64::min(self.capacity, self.tokens + elapsed_ms * self.refill_per_ms);
        self.last_refill = now;
    }

    fn try_take(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens + TOKEN_EPSILON >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until `cost` tokens will be available, assuming no other taker
    ///
    /// Rounded up to whole milliseconds so a wake-up never lands short.
    fn time_until(&self, cost: f64) -> Duration {
        let deficit = (cost - self.tokens).max(0.0);
        let wait_ms = (deficit / self.refill_per_ms).ceil().max(1.0);
        Duration::from_millis(wait_ms as u64)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_ms(&self) -> f64 {
        self.refill_per_ms
    }
}

#[derive(Debug, Clone)]
struct BucketHandle {
    capacity: f64,
    max_queue: usize,
    /// Callers inside `acquire`, waiting or about to be granted
    queued: Arc<AtomicUsize>,
    bucket: Arc<Mutex<RateLimitBucket>>,
}

/// Holds one queue slot; released on drop, including when a waiter is cancelled
struct QueueSlot(Arc<AtomicUsize>);

impl QueueSlot {
    fn claim(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(counter)))
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Async token-bucket limiter keyed by bucket name
#[derive(Debug)]
pub struct RateLimiter {
    exchange: String,
    buckets: RwLock<HashMap<String, BucketHandle>>,
}

impl RateLimiter {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a bucket
    pub fn register(&self, key: &str, capacity: f64, refill_per_ms: f64) -> ExchangeResult<()> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(ExchangeError::Configuration(format!(
                "Bucket '{}': capacity must be positive, got {}",
                key, capacity
            )));
        }
        if !refill_per_ms.is_finite() || refill_per_ms <= 0.0 {
            return Err(ExchangeError::Configuration(format!(
                "Bucket '{}': refill rate must be positive, got {}",
                key, refill_per_ms
            )));
        }

        let handle = BucketHandle {
            capacity,
            max_queue: DEFAULT_MAX_QUEUE,
            queued: Arc::new(AtomicUsize::new(0)),
            bucket: Arc::new(Mutex::new(RateLimitBucket::new(capacity, refill_per_ms))),
        };
        let replaced = self.buckets.write().insert(key.to_string(), handle).is_some();
        tracing::debug!(
            exchange = %self.exchange,
            bucket = key,
            capacity,
            refill_per_ms,
            replaced,
            "Rate limit bucket registered"
        );
        Ok(())
    }

    /// Register using a per-second refill rate, as exchanges document it
    pub fn register_per_second(
        &self,
        key: &str,
        capacity: f64,
        refill_per_second: f64,
    ) -> ExchangeResult<()> {
        self.register(key, capacity, refill_per_second / 1000.0)
    }

    /// Bound the number of concurrent callers on `key`
    pub fn set_max_queue(&self, key: &str, max_queue: usize) -> ExchangeResult<()> {
        if max_queue == 0 {
            return Err(ExchangeError::Configuration(format!(
                "Bucket '{}': max_queue must be positive",
                key
            )));
        }
        let mut buckets = self.buckets.write();
        let handle = buckets.get_mut(key).ok_or_else(|| {
            ExchangeError::Configuration(format!("Unknown rate limit bucket '{}'", key))
        })?;
        handle.max_queue = max_queue;
        Ok(())
    }

    /// Callers currently inside `acquire` on `key`
    pub fn queued(&self, key: &str) -> Option<usize> {
        self.buckets
            .read()
            .get(key)
            .map(|h| h.queued.load(Ordering::Acquire))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.read().contains_key(key)
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn handle(&self, key: &str, cost: f64) -> ExchangeResult<BucketHandle> {
        let handle = self.buckets.read().get(key).cloned().ok_or_else(|| {
            ExchangeError::Configuration(format!("Unknown rate limit bucket '{}'", key))
        })?;
        if !cost.is_finite() || cost < 0.0 {
            return Err(ExchangeError::Configuration(format!(
                "Bucket '{}': invalid cost {}",
                key, cost
            )));
        }
        if cost > handle.capacity + TOKEN_EPSILON {
            return Err(ExchangeError::Configuration(format!(
                "Bucket '{}': cost {} exceeds capacity {}",
                key, cost, handle.capacity
            )));
        }
        Ok(handle)
    }

    /// Wait until `cost` tokens are available in `key`, then take them
    ///
    /// Dropping the returned future while it waits releases its place in the
    /// queue without consuming tokens. Fails with `RateLimitExceeded` when
    /// the bucket already holds `max_queue` callers.
    pub async fn acquire(&self, key: &str, cost: f64) -> ExchangeResult<()> {
        let handle = self.handle(key, cost)?;
        let Some(_slot) = QueueSlot::claim(&handle.queued, handle.max_queue) else {
            tracing::warn!(
                exchange = %self.exchange,
                bucket = key,
                max_queue = handle.max_queue,
                "Rate limit queue full, request rejected"
            );
            return Err(ExchangeError::rate_limited(format!(
                "Bucket '{}': queue full ({} waiters)",
                key, handle.max_queue
            )));
        };
        let mut bucket = handle.bucket.lock().await;
        let mut waited = Duration::ZERO;
        loop {
            if bucket.try_take(cost, Instant::now()) {
                if !waited.is_zero() {
                    tracing::debug!(
                        exchange = %self.exchange,
                        bucket = key,
                        cost,
                        waited_ms = waited.as_millis() as u64,
                        "Rate limit tokens granted after wait"
                    );
                }
                return Ok(());
            }
            let wait = bucket.time_until(cost);
            tracing::trace!(
                exchange = %self.exchange,
                bucket = key,
                cost,
                wait_ms = wait.as_millis() as u64,
                "Waiting for rate limit tokens"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Take `cost` tokens only if they are available right now
    ///
    /// Returns `false` while another caller is queued on the bucket, so a
    /// non-waiting caller can never jump the queue.
    pub fn try_acquire(&self, key: &str, cost: f64) -> ExchangeResult<bool> {
        let handle = self.handle(key, cost)?;
        let granted = match handle.bucket.try_lock() {
            Ok(mut bucket) => bucket.try_take(cost, Instant::now()),
            Err(_) => false,
        };
        Ok(granted)
    }

    /// Tokens currently available in `key`
    ///
    /// `None` for unknown buckets or while a waiter holds the bucket.
    pub fn available(&self, key: &str) -> Option<f64> {
        let handle = self.buckets.read().get(key).cloned()?;
        let mut bucket = handle.bucket.try_lock().ok()?;
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }
}
