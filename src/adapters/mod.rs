//! Exchange-facing building blocks
//!
//! Error taxonomy, request/response types, request signing, retry helpers and
//! the HTTP transport shared by every exchange profile.

pub mod errors;
pub mod shared;
pub mod signing;
pub mod traits;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types for convenience
pub use errors::{classify_response, Diagnostic, ErrorKind, ErrorRules, ExchangeError, ExchangeResult};
pub use shared::{retry_with_backoff, RetryPolicy};
pub use signing::{Credentials, RequestSigner, SigningScheme};
pub use traits::{SigningStrategy, Stamp, Transport};
pub use transport::{create_http_client, ReqwestTransport};
pub use types::{
    HttpMethod, LogicalRequest, OrderBookView, PriceLevel, SignedRequest, TransportResponse,
};
