//! HTTP transport backed by reqwest
//!
//! The dispatcher only sees the [`Transport`] trait; this is the production
//! implementation. Any failure to obtain a response (DNS, connect, timeout,
//! body read) maps to `ExchangeUnavailable` so the retry policy can handle it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::traits::Transport;
use crate::adapters::types::{HttpMethod, SignedRequest, TransportResponse};

// =============================================================================
// HTTP Client Constants
// =============================================================================

/// HTTP request timeout (seconds)
const HTTP_TIMEOUT_SECS: u64 = 10;
/// HTTP connection timeout (milliseconds), fail fast if host unreachable
const HTTP_CONNECT_TIMEOUT_MS: u64 = 3000;
/// Max idle connections per host in connection pool
const HTTP_POOL_MAX_IDLE: usize = 8;
/// How long idle connections stay in the pool (seconds)
const HTTP_POOL_IDLE_TIMEOUT_SECS: u64 = 60;
/// TCP keepalive interval (seconds)
const HTTP_TCP_KEEPALIVE_SECS: u64 = 30;

/// Create a pooled HTTP client for one exchange
///
/// Connection pooling + TCP_NODELAY configured for latency.
pub fn create_http_client(exchange_name: &str) -> ExchangeResult<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE)
        .pool_idle_timeout(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECS))
        .tcp_keepalive(Duration::from_secs(HTTP_TCP_KEEPALIVE_SECS))
        .connect_timeout(Duration::from_millis(HTTP_CONNECT_TIMEOUT_MS))
        .tcp_nodelay(true)
        .build()
        .map_err(|e| ExchangeError::Configuration(format!("HTTP client build failed: {}", e)))?;
    tracing::info!(
        phase = "init",
        exchange = %exchange_name,
        timeout_s = HTTP_TIMEOUT_SECS,
        connect_timeout_ms = HTTP_CONNECT_TIMEOUT_MS,
        pool_max_idle = HTTP_POOL_MAX_IDLE,
        pool_idle_timeout_s = HTTP_POOL_IDLE_TIMEOUT_SECS,
        tcp_keepalive_s = HTTP_TCP_KEEPALIVE_SECS,
        tcp_nodelay = true,
        "HTTP client configured"
    );
    Ok(client)
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

/// Production [`Transport`] over a shared reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    exchange: String,
}

impl ReqwestTransport {
    pub fn new(exchange: &str) -> ExchangeResult<Self> {
        Ok(Self {
            client: create_http_client(exchange)?,
            exchange: exchange.to_string(),
        })
    }

    /// Wrap an existing client (shared pools, custom TLS)
    pub fn with_client(exchange: &str, client: reqwest::Client) -> Self {
        Self {
            client,
            exchange: exchange.to_string(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: SignedRequest) -> ExchangeResult<TransportResponse> {
        let SignedRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(to_reqwest_method(method), &url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let start = std::time::Instant::now();
        let response = builder.send().await.map_err(|e| {
            let kind = if e.is_timeout() { "timeout" } else { "network" };
            tracing::warn!(exchange = %self.exchange, %method, kind, error = %e, "HTTP request failed");
            ExchangeError::unavailable(format!("{} error: {}", kind, e))
        })?;

        let status = response.status().as_u16();
        let mut response_headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExchangeError::unavailable(format!("Failed to read body: {}", e)))?;

        tracing::debug!(
            exchange = %self.exchange,
            %method,
            status,
            latency_ms = start.elapsed().as_millis() as u64,
            "HTTP response"
        );

        Ok(TransportResponse {
            status,
            headers: response_headers,
            body: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mapping() {
        assert_eq!(to_reqwest_method(HttpMethod::Get), reqwest::Method::GET);
        assert_eq!(to_reqwest_method(HttpMethod::Delete), reqwest::Method::DELETE);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_unavailable() {
        let transport = ReqwestTransport::new("test").unwrap();
        // Port 9 on localhost is the discard service, normally closed
        let request = SignedRequest {
            method: HttpMethod::Get,
            url: "http://127.0.0.1:9/ping".into(),
            headers: HashMap::new(),
            body: None,
        };
        let err = transport.send(request).await.unwrap_err();
        assert!(err.is_transient(), "got {:?}", err);
    }
}
