//! Exchange profile configuration types
//!
//! One `ExchangeProfile` describes everything the core needs to talk to an
//! exchange: base URL, rate-limit buckets, retry policy, signing scheme,
//! error-code tables, book synchronization rules and the endpoint table.
//! Profiles are loaded from YAML and validated before use.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::adapters::errors::ErrorRules;
use crate::adapters::shared::RetryPolicy;
use crate::adapters::signing::SigningScheme;
use crate::adapters::types::HttpMethod;
use crate::core::rate_limit::DEFAULT_MAX_QUEUE;
use crate::core::sync::SyncConfig;
use crate::error::AppError;

// ============================================================================
// Rate Limits
// ============================================================================

/// One token bucket, as documented by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Weight class name referenced by endpoints (e.g. "ip", "orders")
    pub key: String,
    /// Maximum tokens held
    pub capacity: f64,
    /// Tokens restored per second
    pub refill_per_second: f64,
    /// Callers allowed to wait on the bucket at once
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

fn default_max_queue() -> usize {
    DEFAULT_MAX_QUEUE
}

// ============================================================================
// Endpoints
// ============================================================================

/// Where request parameters are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Query,
    Body,
}

/// Declared endpoint parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller does not override it
    #[serde(default)]
    pub default: Option<String>,
}

/// Cost step: applies when the parameter value is `<= max`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTier {
    pub max: f64,
    pub cost: f64,
}

/// Parameter-dependent cost (e.g. order-book depth `limit`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTiers {
    pub param: String,
    pub tiers: Vec<CostTier>,
}

fn default_cost() -> f64 {
    1.0
}

/// One REST endpoint of the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Name adapters call the endpoint by (e.g. "depth", "place_order")
    pub name: String,
    pub method: HttpMethod,
    /// Path relative to the base URL; `{param}` placeholders are filled from params
    pub path: String,
    /// Rate-limit bucket charged per call
    pub bucket: String,
    /// Base cost in tokens
    #[serde(default = "default_cost")]
    pub cost: f64,
    #[serde(default)]
    pub cost_tiers: Option<CostTiers>,
    /// Whether the request must be signed
    #[serde(default)]
    pub auth: bool,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Accept parameters not declared in `params`
    #[serde(default)]
    pub allow_extra: bool,
    /// Defaults to query for GET/DELETE and body otherwise
    #[serde(default)]
    pub params_in: Option<ParamLocation>,
}

impl EndpointConfig {
    pub fn param_location(&self) -> ParamLocation {
        self.params_in.unwrap_or(match self.method {
            HttpMethod::Get | HttpMethod::Delete => ParamLocation::Query,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch => ParamLocation::Body,
        })
    }

    /// Largest cost this endpoint can ever charge
    pub fn max_cost(&self) -> f64 {
        self.cost_tiers
            .iter()
            .flat_map(|t| t.tiers.iter().map(|tier| tier.cost))
            .fold(self.cost, f64::max)
    }
}

// ============================================================================
// Exchange Profile
// ============================================================================

/// Complete configuration of one exchange client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeProfile {
    /// Exchange identifier used in logs (e.g. "binance")
    pub id: String,
    pub base_url: String,
    pub rate_limits: Vec<RateLimitConfig>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub signing: SigningScheme,
    /// Parameter carrying the idempotency key (e.g. "newClientOrderId")
    #[serde(default)]
    pub idempotency_param: Option<String>,
    #[serde(default)]
    pub errors: ErrorRules,
    #[serde(default)]
    pub book: SyncConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl ExchangeProfile {
    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn rate_limit(&self, key: &str) -> Option<&RateLimitConfig> {
        self.rate_limits.iter().find(|r| r.key == key)
    }

    /// Validate profile rules
    pub fn validate(&self) -> Result<(), AppError> {
        // Rule: exchange ID cannot be empty
        if self.id.trim().is_empty() {
            return Err(AppError::Config("Exchange ID cannot be empty".to_string()));
        }

        // Rule: base URL must parse
        url::Url::parse(&self.base_url).map_err(|e| {
            AppError::Config(format!(
                "Exchange '{}': invalid base_url '{}': {}",
                self.id, self.base_url, e
            ))
        })?;

        // Rule: bucket keys unique, capacity, refill and queue positive
        let mut keys = HashSet::new();
        for limit in &self.rate_limits {
            if !keys.insert(limit.key.as_str()) {
                return Err(AppError::Config(format!(
                    "Exchange '{}': duplicate rate limit bucket '{}'",
                    self.id, limit.key
                )));
            }
            if !limit.capacity.is_finite() || limit.capacity <= 0.0 {
                return Err(AppError::Config(format!(
                    "Exchange '{}': bucket '{}' capacity must be > 0 (got {})",
                    self.id, limit.key, limit.capacity
                )));
            }
            if !limit.refill_per_second.is_finite() || limit.refill_per_second <= 0.0 {
                return Err(AppError::Config(format!(
                    "Exchange '{}': bucket '{}' refill_per_second must be > 0 (got {})",
                    self.id, limit.key, limit.refill_per_second
                )));
            }
            if limit.max_queue == 0 {
                return Err(AppError::Config(format!(
                    "Exchange '{}': bucket '{}' max_queue must be > 0",
                    self.id, limit.key
                )));
            }
        }

        // Rule: backoff bounds ordered
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::Config(format!(
                "Exchange '{}': retry initial_delay_ms ({}) must be <= max_delay_ms ({})",
                self.id, self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }

        // Rule: endpoint names unique, buckets known, costs fit the bucket
        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if !names.insert(endpoint.name.as_str()) {
                return Err(AppError::Config(format!(
                    "Exchange '{}': duplicate endpoint '{}'",
                    self.id, endpoint.name
                )));
            }
            let bucket = self.rate_limit(&endpoint.bucket).ok_or_else(|| {
                AppError::Config(format!(
                    "Exchange '{}': endpoint '{}' references unknown bucket '{}'",
                    self.id, endpoint.name, endpoint.bucket
                ))
            })?;
            let costs_valid = std::iter::once(endpoint.cost)
                .chain(endpoint.cost_tiers.iter().flat_map(|t| t.tiers.iter().map(|x| x.cost)))
                .all(|c| c.is_finite() && c >= 0.0);
            if !costs_valid {
                return Err(AppError::Config(format!(
                    "Exchange '{}': endpoint '{}' has a negative or non-finite cost",
                    self.id, endpoint.name
                )));
            }
            if endpoint.max_cost() > bucket.capacity {
                return Err(AppError::Config(format!(
                    "Exchange '{}': endpoint '{}' cost {} exceeds bucket '{}' capacity {}",
                    self.id,
                    endpoint.name,
                    endpoint.max_cost(),
                    bucket.key,
                    bucket.capacity
                )));
            }
            if let Some(tiers) = &endpoint.cost_tiers {
                if tiers.tiers.is_empty() {
                    return Err(AppError::Config(format!(
                        "Exchange '{}': endpoint '{}' cost_tiers has no tiers",
                        self.id, endpoint.name
                    )));
                }
            }
        }

        Ok(())
    }
}
