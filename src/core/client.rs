//! Per-exchange client facade
//!
//! Wires a validated `ExchangeProfile` into its own rate limiter, signer,
//! dispatcher and book registry. Nothing is shared between clients, so two
//! profiles for the same venue keep separate buckets and nonces.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::signing::{Credentials, RequestSigner};
use crate::adapters::traits::Transport;
use crate::adapters::transport::ReqwestTransport;
use crate::adapters::types::{OrderBookView, TransportResponse};
use crate::config::types::ExchangeProfile;
use crate::core::dispatcher::Dispatcher;
use crate::core::feed::{spawn_feed_consumer, BookRegistry, FeedStats};
use crate::core::rate_limit::RateLimiter;
use crate::core::weights::EndpointTable;

/// Entry point adapters use to talk to one exchange
#[derive(Debug)]
pub struct ExchangeClient {
    profile: ExchangeProfile,
    endpoints: EndpointTable,
    dispatcher: Dispatcher,
    books: Arc<BookRegistry>,
}

impl ExchangeClient {
    /// Build a client over an arbitrary transport
    pub fn from_profile(
        profile: &ExchangeProfile,
        credentials: Option<Credentials>,
        transport: Arc<dyn Transport>,
    ) -> ExchangeResult<Self> {
        profile
            .validate()
            .map_err(|e| ExchangeError::Configuration(e.to_string()))?;

        let limiter = RateLimiter::new(&profile.id);
        for limit in &profile.rate_limits {
            limiter.register_per_second(&limit.key, limit.capacity, limit.refill_per_second)?;
            limiter.set_max_queue(&limit.key, limit.max_queue)?;
        }

        let signer = RequestSigner::from_scheme(&profile.signing, credentials);
        let signing = signer.strategy_name();
        let has_credentials = signer.has_credentials();

        let mut dispatcher = Dispatcher::new(
            &profile.id,
            &profile.base_url,
            Arc::new(limiter),
            signer,
            transport,
        )
        .with_error_rules(profile.errors.clone());
        if let Some(param) = &profile.idempotency_param {
            dispatcher = dispatcher.with_idempotency_param(param);
        }

        let endpoints = EndpointTable::new(&profile.endpoints)?;
        let books = Arc::new(BookRegistry::new(&profile.id, profile.book.clone()));

        info!(
            phase = "init",
            exchange = %profile.id,
            base_url = %profile.base_url,
            buckets = profile.rate_limits.len(),
            endpoints = endpoints.len(),
            signing,
            has_credentials,
            "Exchange client ready"
        );

        Ok(Self {
            profile: profile.clone(),
            endpoints,
            dispatcher,
            books,
        })
    }

    /// Build a client over a pooled reqwest transport
    pub fn connect(profile: &ExchangeProfile, credentials: Option<Credentials>) -> ExchangeResult<Self> {
        let transport = ReqwestTransport::new(&profile.id)?;
        Self::from_profile(profile, credentials, Arc::new(transport))
    }

    pub fn profile(&self) -> &ExchangeProfile {
        &self.profile
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.dispatcher.limiter()
    }

    pub fn books(&self) -> &Arc<BookRegistry> {
        &self.books
    }

    /// Fresh time-ordered idempotency key
    pub fn new_idempotency_key() -> String {
        uuid::Uuid::now_v7().to_string()
    }

    /// Call a named endpoint with caller overrides
    pub async fn call(
        &self,
        endpoint: &str,
        overrides: &BTreeMap<String, String>,
        idempotency_key: Option<String>,
    ) -> ExchangeResult<TransportResponse> {
        self.call_cancellable(endpoint, overrides, idempotency_key, &CancellationToken::new())
            .await
    }

    pub async fn call_cancellable(
        &self,
        endpoint: &str,
        overrides: &BTreeMap<String, String>,
        idempotency_key: Option<String>,
        cancel: &CancellationToken,
    ) -> ExchangeResult<TransportResponse> {
        let (mut request, cost) = self.endpoints.build_request(endpoint, overrides)?;
        request.idempotency_key = idempotency_key;
        self.dispatcher
            .execute_cancellable(request, &cost, &self.profile.retry, cancel)
            .await
    }

    /// [`ExchangeClient::call`] with the body decoded as JSON
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        overrides: &BTreeMap<String, String>,
        idempotency_key: Option<String>,
    ) -> ExchangeResult<T> {
        self.call(endpoint, overrides, idempotency_key).await?.json()
    }

    /// Reader copy of a book; `None` for symbols never seen
    pub fn get_order_book(&self, symbol: &str) -> Option<OrderBookView> {
        self.books.get_order_book(symbol)
    }

    /// Start draining a stream of raw book messages into this client's books
    pub fn spawn_feed(&self, rx: mpsc::Receiver<String>, cancel: CancellationToken) -> JoinHandle<FeedStats> {
        spawn_feed_consumer(Arc::clone(&self.books), rx, cancel)
    }
}
