//! Collaborator and capability traits
//!
//! `Transport` is the seam to the HTTP collaborator; `SigningStrategy` is the
//! per-exchange signing capability selected by configuration.

use async_trait::async_trait;

use crate::adapters::errors::ExchangeResult;
use crate::adapters::signing::Credentials;
use crate::adapters::types::{LogicalRequest, SignedRequest, TransportResponse};

/// HTTP collaborator executing one signed request
///
/// Implementations must map network failures and timeouts to
/// `ExchangeError::ExchangeUnavailable`. Non-2xx responses are returned as
/// `Ok`; classifying them is the dispatcher's job.
///
/// # Example Implementation
///
/// ```ignore
/// struct Recorder(Mutex<Vec<SignedRequest>>);
///
/// #[async_trait]
/// impl Transport for Recorder {
///     async fn send(&self, request: SignedRequest) -> ExchangeResult<TransportResponse> {
///         self.0.lock().push(request);
///         Ok(TransportResponse::new(200, "{}"))
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: SignedRequest) -> ExchangeResult<TransportResponse>;
}

/// Timestamp and nonce handed to a strategy for one signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    /// Unix milliseconds
    pub timestamp_ms: u64,
    /// Strictly increasing per credential set; present when the strategy uses nonces
    pub nonce: Option<u64>,
}

/// Exchange-specific signing algorithm
///
/// Given a prepared request and credentials, return the request with its
/// authentication headers/body augmentations applied. Must be a pure function
/// of its inputs.
pub trait SigningStrategy: Send + Sync + std::fmt::Debug {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Whether this strategy needs a nonce in its `Stamp`
    fn uses_nonce(&self) -> bool {
        false
    }

    fn sign(
        &self,
        request: &LogicalRequest,
        base_url: &str,
        credentials: &Credentials,
        stamp: Stamp,
    ) -> ExchangeResult<SignedRequest>;
}
