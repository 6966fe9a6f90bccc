//! Configuration module for exchange profiles and logging
//!
//! This module provides:
//! - Profile types (`ExchangeProfile`, `EndpointConfig`, `RateLimitConfig`, ...)
//! - YAML loading functionality (`load_config`)
//! - Tracing subscriber setup (`logging`)

mod loader;
pub mod logging;
pub mod types;

// Re-export types
pub use types::{
    CostTier, CostTiers, EndpointConfig, ExchangeProfile, ParamLocation, ParamSpec, RateLimitConfig,
};

// Re-export loader functions
pub use loader::{load_config, load_config_from_str};
