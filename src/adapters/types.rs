//! Core data types shared by the dispatch pipeline and the order-book engine
//!
//! These types are used across all exchange adapters for consistent
//! request, response and orderbook representation.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::adapters::errors::{ExchangeError, ExchangeResult};

/// Current wall-clock time in Unix milliseconds
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Request Types
// =============================================================================

/// HTTP method of a logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }

    /// Read-only requests may be retried freely
    pub fn is_read_only(&self) -> bool {
        matches!(self, HttpMethod::Get)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as built by adapter code, before signing
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRequest {
    pub method: HttpMethod,
    /// Path relative to the exchange base URL (e.g. "/api/v3/order")
    pub path: String,
    /// Query parameters, sorted by key
    pub query: BTreeMap<String, String>,
    /// JSON body for state-changing requests
    pub body: Option<serde_json::Value>,
    /// Whether the endpoint requires a signature
    pub requires_auth: bool,
    /// Client-generated token the exchange uses to deduplicate submissions
    pub idempotency_key: Option<String>,
}

impl LogicalRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
            requires_auth: false,
            idempotency_key: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn signed(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Whether the dispatcher is allowed to send this request more than once
    pub fn is_retry_safe(&self) -> bool {
        self.method.is_read_only() || self.idempotency_key.is_some()
    }

    /// Url-encoded query string (no leading '?')
    pub fn query_string(&self) -> String {
        encode_query(&self.query)
    }

    /// Serialized body bytes, if any
    pub fn body_bytes(&self) -> ExchangeResult<Option<Vec<u8>>> {
        self.body
            .as_ref()
            .map(|b| {
                serde_json::to_vec(b).map_err(|e| {
                    ExchangeError::invalid_request(format!("Unserializable body: {}", e))
                })
            })
            .transpose()
    }
}

/// Url-encode a parameter map
pub fn encode_query(params: &BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

/// Join base URL, path and query into a full URL
pub fn build_url(base_url: &str, path: &str, query: &str) -> String {
    let mut url = String::with_capacity(base_url.len() + path.len() + query.len() + 1);
    url.push_str(base_url.trim_end_matches('/'));
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// A fully prepared request, ready for the transport
///
/// Produced once by the signer and moved into the transport, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl SignedRequest {
    /// Build an unsigned request (public endpoints)
    pub fn unsigned(request: &LogicalRequest, base_url: &str) -> ExchangeResult<Self> {
        let body = request.body_bytes()?;
        let mut headers = HashMap::new();
        if body.is_some() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        Ok(Self {
            method: request.method,
            url: build_url(base_url, &request.path, &request.query_string()),
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response returned by the transport collaborator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are stored lowercase
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> ExchangeResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ExchangeError::InvalidResponse(format!("Failed to parse body: {}", e)))
    }

    /// `Retry-After` header in milliseconds (delta-seconds form only)
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| (secs * 1000.0) as u64)
    }
}

// =============================================================================
// Orderbook Types
// =============================================================================

/// A single level in the orderbook (price + size)
///
/// Size is never negative; a zero size in a delta removes the level.
/// Deserializes from `[price, size, ...]` with string or numeric entries;
/// trailing elements (order counts etc.) are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> ExchangeResult<Self> {
        if size.is_sign_negative() && !size.is_zero() {
            return Err(ExchangeError::InvalidResponse(format!(
                "Negative size {} at price {}",
                size, price
            )));
        }
        Ok(Self { price, size })
    }

    pub fn is_removal(&self) -> bool {
        self.size.is_zero()
    }
}

impl Serialize for PriceLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.price.to_string())?;
        tuple.serialize_element(&self.size.to_string())?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for PriceLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let raw: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
        if raw.len() < 2 {
            return Err(D::Error::custom(format!(
                "price level needs [price, size], got {} elements",
                raw.len()
            )));
        }
        let price = decimal_from_json(&raw[0]).map_err(D::Error::custom)?;
        let size = decimal_from_json(&raw[1]).map_err(D::Error::custom)?;
        PriceLevel::new(price, size).map_err(D::Error::custom)
    }
}

/// Parse a decimal from a JSON string or number without going through f64
pub fn decimal_from_json(value: &serde_json::Value) -> ExchangeResult<Decimal> {
    let text = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(ExchangeError::InvalidResponse(format!(
                "Expected decimal, got {}",
                other
            )))
        }
    };
    let parsed = if text.contains(['e', 'E']) {
        Decimal::from_scientific(&text)
    } else {
        text.parse::<Decimal>()
    };
    parsed.map_err(|e| ExchangeError::InvalidResponse(format!("Invalid decimal '{}': {}", text, e)))
}

/// Immutable reader-facing copy of one symbol's book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookView {
    pub symbol: String,
    /// Bid levels sorted descending by price (best bid first)
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted ascending by price (best ask first)
    pub asks: Vec<PriceLevel>,
    pub sequence: Option<u64>,
    /// Exchange timestamp of the last applied message (Unix ms)
    pub timestamp: u64,
    /// True while the book is not known to be consistent
    pub is_stale: bool,
}

impl OrderBookView {
    /// Empty view flagged stale
    pub fn stale(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            is_stale: true,
            ..Self::default()
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }
}
