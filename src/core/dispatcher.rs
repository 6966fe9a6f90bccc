//! Signed-request dispatch pipeline
//!
//! Every attempt runs `acquire → sign → send → classify`. Signing happens
//! inside the attempt so retries carry a fresh timestamp and nonce, and the
//! rate limiter is charged for each attempt that actually goes out.
//!
//! Only read-only requests, or state-changing requests carrying an
//! idempotency key, are retried. Anything else gets exactly one attempt and
//! its original error.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::errors::{classify_response, ErrorRules, ExchangeError, ExchangeResult};
use crate::adapters::shared::{retry_with_backoff_cancellable, RetryPolicy};
use crate::adapters::signing::RequestSigner;
use crate::adapters::traits::Transport;
use crate::adapters::types::{HttpMethod, LogicalRequest, TransportResponse};
use crate::core::rate_limit::RateLimiter;
use crate::core::weights::RequestCost;

/// Sends logical requests for one exchange
pub struct Dispatcher {
    exchange: String,
    base_url: String,
    limiter: Arc<RateLimiter>,
    signer: RequestSigner,
    transport: Arc<dyn Transport>,
    error_rules: ErrorRules,
    /// Parameter name the idempotency key is written under
    idempotency_param: Option<String>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("exchange", &self.exchange)
            .field("base_url", &self.base_url)
            .field("signer", &self.signer)
            .field("idempotency_param", &self.idempotency_param)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        exchange: impl Into<String>,
        base_url: impl Into<String>,
        limiter: Arc<RateLimiter>,
        signer: RequestSigner,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            base_url: base_url.into(),
            limiter,
            signer,
            transport,
            error_rules: ErrorRules::default(),
            idempotency_param: None,
        }
    }

    pub fn with_error_rules(mut self, rules: ErrorRules) -> Self {
        self.error_rules = rules;
        self
    }

    pub fn with_idempotency_param(mut self, param: impl Into<String>) -> Self {
        self.idempotency_param = Some(param.into());
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Execute a request under the given retry policy
    pub async fn execute(
        &self,
        request: LogicalRequest,
        cost: &RequestCost,
        policy: &RetryPolicy,
    ) -> ExchangeResult<TransportResponse> {
        self.execute_cancellable(request, cost, policy, &CancellationToken::new())
            .await
    }

    /// [`Dispatcher::execute`] that aborts with `Cancelled` when `cancel` fires
    ///
    /// A request already delivered to a state-changing endpoint is not undone.
    pub async fn execute_cancellable(
        &self,
        request: LogicalRequest,
        cost: &RequestCost,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> ExchangeResult<TransportResponse> {
        let request = self.with_idempotency(request);
        let policy = if request.is_retry_safe() {
            *policy
        } else {
            policy.single_attempt()
        };
        let label = format!("{} {} {}", self.exchange, request.method, request.path);

        retry_with_backoff_cancellable(&policy, &label, cancel, |attempt| {
            self.attempt(&request, cost, attempt, cancel)
        })
        .await
    }

    async fn attempt(
        &self,
        request: &LogicalRequest,
        cost: &RequestCost,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> ExchangeResult<TransportResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ExchangeError::Cancelled(format!(
                    "{}: cancelled while waiting for bucket '{}'",
                    self.exchange, cost.bucket
                )));
            }
            acquired = self.limiter.acquire(&cost.bucket, cost.weight) => acquired?,
        }

        let signed = self.signer.sign(request, &self.base_url)?;
        debug!(
            exchange = %self.exchange,
            method = %request.method,
            path = %request.path,
            bucket = %cost.bucket,
            weight = cost.weight,
            attempt = attempt + 1,
            "Dispatching request"
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ExchangeError::Cancelled(format!(
                    "{}: cancelled awaiting response for {}",
                    self.exchange, request.path
                )));
            }
            sent = self.transport.send(signed) => sent?,
        };

        let body = response.text();
        if let Err(error) = classify_response(
            response.status,
            &body,
            response.retry_after_ms(),
            &self.error_rules,
        ) {
            warn!(
                exchange = %self.exchange,
                path = %request.path,
                status = response.status,
                attempt = attempt + 1,
                error = %error,
                "Request failed"
            );
            return Err(error);
        }
        Ok(response)
    }

    /// Write the idempotency key into the request parameters
    ///
    /// GET/DELETE carry it in the query, everything else in the JSON body
    /// object. A value the caller already set under the same name is kept.
    fn with_idempotency(&self, mut request: LogicalRequest) -> LogicalRequest {
        let (Some(param), Some(key)) = (&self.idempotency_param, &request.idempotency_key) else {
            return request;
        };
        let key = key.clone();
        match (request.method, request.body.as_mut()) {
            (HttpMethod::Get | HttpMethod::Delete, _) | (_, None) => {
                request.query.entry(param.clone()).or_insert(key);
            }
            (_, Some(serde_json::Value::Object(body))) => {
                body.entry(param.clone())
                    .or_insert_with(|| serde_json::Value::String(key));
            }
            // Non-object bodies have nowhere to carry the key
            (_, Some(_)) => {
                request.query.entry(param.clone()).or_insert(key);
            }
        }
        request
    }
}
