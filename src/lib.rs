//! Exchange connectivity core
//!
//! Shared foundation for exchange adapters:
//! - Signed REST dispatch (rate limiting, signing, bounded retry, error taxonomy)
//! - Local order-book replicas kept in sync from snapshot/delta streams
//! - YAML exchange profiles and tracing setup

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;

pub use error::AppError;
