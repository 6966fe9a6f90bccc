//! Shared helpers for the dispatch pipeline

pub mod retry;

pub use retry::{retry_with_backoff, retry_with_backoff_cancellable, RetryPolicy};
