//! Request signing
//!
//! `RequestSigner` turns a [`LogicalRequest`] into a transport-ready
//! [`SignedRequest`]. The algorithm is a [`SigningStrategy`] chosen from the
//! exchange profile's [`SigningScheme`]; credentials and the nonce counter are
//! owned per signer instance, never global.

pub mod ed25519;
pub mod eip191;
pub mod hmac;
pub mod nonce;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::traits::{SigningStrategy, Stamp};
use crate::adapters::types::{current_time_ms, LogicalRequest, SignedRequest};

pub use self::ed25519::Ed25519Signer;
pub use self::eip191::{Eip191Headers, Eip191Signer};
pub use self::hmac::{HmacHeaderNames, HmacHeaderSigner, HmacQuerySigner, TimestampFormat};
pub use self::nonce::NonceCounter;

// =============================================================================
// Credentials
// =============================================================================

/// API credentials for one account
///
/// `secret` holds whatever the strategy needs: an HMAC secret, a hex Ed25519
/// seed or a hex secp256k1 private key.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: Option<String>,
    /// Account / sub-account identifier, for venues that need one
    pub account: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: None,
            account: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Read `<PREFIX>_API_KEY`, `<PREFIX>_API_SECRET`, `<PREFIX>_PASSPHRASE`
    /// and `<PREFIX>_ACCOUNT`.
    ///
    /// Returns `None` when neither key nor secret is set. Empty values count
    /// as absent.
    pub fn from_env(prefix: &str) -> Option<Self> {
        let read = |suffix: &str| {
            std::env::var(format!("{}_{}", prefix, suffix))
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let api_key = read("API_KEY");
        let secret = read("API_SECRET");
        if api_key.is_none() && secret.is_none() {
            return None;
        }
        Some(Self {
            api_key: api_key.unwrap_or_default(),
            secret: secret.unwrap_or_default(),
            passphrase: read("PASSPHRASE"),
            account: read("ACCOUNT"),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &redact(&self.api_key))
            .field("secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("account", &self.account)
            .finish()
    }
}

/// Keep only a short prefix of an API key for log correlation
fn redact(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let prefix: String = value.chars().take(4).collect();
    format!("{}…", prefix)
}

/// Load a `.env` file from the working directory if present
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }
}

/// Recursively sort object keys so the serialized form is canonical
pub fn canonical_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(fields.len());
            for key in keys {
                sorted.insert(key.clone(), canonical_json(&fields[key.as_str()]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical_json).collect())
        }
        other => other.clone(),
    }
}

// =============================================================================
// Scheme Selection
// =============================================================================

fn default_api_key_header() -> String {
    "X-API-KEY".to_string()
}

fn default_signature_header() -> String {
    "X-SIGNATURE".to_string()
}

/// Signing algorithm of an exchange profile
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum SigningScheme {
    /// Public-only exchange profile
    #[default]
    None,
    HmacQuery {
        #[serde(default = "default_api_key_header")]
        api_key_header: String,
        #[serde(default)]
        recv_window_ms: Option<u64>,
    },
    HmacHeader {
        headers: HmacHeaderNames,
        #[serde(default)]
        timestamp_format: TimestampFormat,
    },
    Ed25519 {
        #[serde(default = "default_api_key_header")]
        key_header: String,
        #[serde(default = "default_signature_header")]
        signature_header: String,
    },
    Eip191 {
        #[serde(default)]
        headers: Eip191Headers,
    },
}

/// Strategy that refuses to sign anything
#[derive(Debug, Clone, Copy)]
struct NoSigning;

impl SigningStrategy for NoSigning {
    fn name(&self) -> &'static str {
        "none"
    }

    fn sign(
        &self,
        request: &LogicalRequest,
        _base_url: &str,
        _credentials: &Credentials,
        _stamp: Stamp,
    ) -> ExchangeResult<SignedRequest> {
        Err(ExchangeError::authentication(format!(
            "{} {} requires authentication but the profile has no signing scheme",
            request.method, request.path
        )))
    }
}

/// Instantiate the strategy for a configured scheme
pub fn build_strategy(scheme: &SigningScheme) -> Arc<dyn SigningStrategy> {
    match scheme {
        SigningScheme::None => Arc::new(NoSigning),
        SigningScheme::HmacQuery {
            api_key_header,
            recv_window_ms,
        } => Arc::new(HmacQuerySigner::new(api_key_header.clone(), *recv_window_ms)),
        SigningScheme::HmacHeader {
            headers,
            timestamp_format,
        } => Arc::new(HmacHeaderSigner::new(headers.clone(), *timestamp_format)),
        SigningScheme::Ed25519 {
            key_header,
            signature_header,
        } => Arc::new(Ed25519Signer::new(key_header.clone(), signature_header.clone())),
        SigningScheme::Eip191 { headers } => Arc::new(Eip191Signer::new(headers.clone())),
    }
}

// =============================================================================
// Request Signer
// =============================================================================

/// Signs requests for one exchange client
#[derive(Debug)]
pub struct RequestSigner {
    strategy: Arc<dyn SigningStrategy>,
    credentials: Option<Credentials>,
    nonce: NonceCounter,
}

impl RequestSigner {
    pub fn new(strategy: Arc<dyn SigningStrategy>, credentials: Option<Credentials>) -> Self {
        Self {
            strategy,
            credentials,
            nonce: NonceCounter::new(),
        }
    }

    pub fn from_scheme(scheme: &SigningScheme, credentials: Option<Credentials>) -> Self {
        Self::new(build_strategy(scheme), credentials)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Sign with the current wall-clock time
    pub fn sign(&self, request: &LogicalRequest, base_url: &str) -> ExchangeResult<SignedRequest> {
        self.sign_at(request, base_url, current_time_ms())
    }

    /// Sign with an explicit timestamp
    pub fn sign_at(
        &self,
        request: &LogicalRequest,
        base_url: &str,
        now_ms: u64,
    ) -> ExchangeResult<SignedRequest> {
        if !request.requires_auth {
            return SignedRequest::unsigned(request, base_url);
        }

        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ExchangeError::authentication(format!(
                "{} {} requires credentials but none are configured",
                request.method, request.path
            ))
        })?;

        let nonce = self
            .strategy
            .uses_nonce()
            .then(|| self.nonce.next(now_ms));
        let stamp = Stamp {
            timestamp_ms: now_ms,
            nonce,
        };

        tracing::trace!(
            strategy = self.strategy.name(),
            method = %request.method,
            path = %request.path,
            nonce = ?nonce,
            "Signing request"
        );
        self.strategy.sign(request, base_url, credentials, stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn query_scheme() -> SigningScheme {
        SigningScheme::HmacQuery {
            api_key_header: "X-MBX-APIKEY".into(),
            recv_window_ms: None,
        }
    }

    #[test]
    fn test_unsigned_request_skips_strategy() {
        let signer = RequestSigner::from_scheme(&query_scheme(), None);
        let request = LogicalRequest::get("/api/v3/depth").param("symbol", "BTCUSDT");
        let signed = signer.sign_at(&request, "https://api.test", 1).unwrap();
        assert_eq!(signed.url, "https://api.test/api/v3/depth?symbol=BTCUSDT");
        assert!(signed.headers.is_empty());
    }

    #[test]
    fn test_auth_required_without_credentials() {
        let signer = RequestSigner::from_scheme(&query_scheme(), None);
        let request = LogicalRequest::get("/api/v3/account").signed();
        let err = signer.sign_at(&request, "https://api.test", 1).unwrap_err();
        assert!(matches!(err, ExchangeError::Authentication { .. }));
    }

    #[test]
    fn test_none_scheme_rejects_signed_requests() {
        let signer = RequestSigner::from_scheme(&SigningScheme::None, Some(Credentials::new("k", "s")));
        let request = LogicalRequest::get("/private").signed();
        assert!(signer.sign_at(&request, "https://api.test", 1).is_err());
    }

    #[test]
    fn test_signing_is_deterministic_for_fixed_time() {
        let signer = RequestSigner::from_scheme(&query_scheme(), Some(Credentials::new("k", "s")));
        let request = LogicalRequest::get("/api/v3/account").signed();
        let a = signer.sign_at(&request, "https://api.test", 1_700_000_000_000).unwrap();
        let b = signer.sign_at(&request, "https://api.test", 1_700_000_000_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_nonce_strategy_gets_fresh_nonce_per_call() {
        let scheme = SigningScheme::Ed25519 {
            key_header: "X-KEY".into(),
            signature_header: "X-SIG".into(),
        };
        let seed = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
        let signer = RequestSigner::from_scheme(&scheme, Some(Credentials::new("pk", seed)));
        let request = LogicalRequest::get("/v1/balances").signed();

        let first = signer.sign_at(&request, "https://dex.test", 1_000).unwrap();
        let second = signer.sign_at(&request, "https://dex.test", 1_000).unwrap();
        assert!(first.url.ends_with("nonce=1000"), "got {}", first.url);
        assert!(second.url.ends_with("nonce=1001"), "got {}", second.url);
    }

    #[test]
    fn test_scheme_deserializes_from_yaml() {
        let yaml = r#"
scheme: hmac_header
headers:
  key: OK-ACCESS-KEY
  sign: OK-ACCESS-SIGN
  timestamp: OK-ACCESS-TIMESTAMP
  passphrase: OK-ACCESS-PASSPHRASE
"#;
        let scheme: SigningScheme = serde_yaml::from_str(yaml).unwrap();
        match scheme {
            SigningScheme::HmacHeader { headers, timestamp_format } => {
                assert_eq!(headers.passphrase.as_deref(), Some("OK-ACCESS-PASSPHRASE"));
                assert_eq!(timestamp_format, TimestampFormat::Iso8601);
            }
            other => panic!("unexpected scheme {:?}", other),
        }

        let scheme: SigningScheme = serde_yaml::from_str("scheme: ed25519").unwrap();
        assert_eq!(
            scheme,
            SigningScheme::Ed25519 {
                key_header: "X-API-KEY".into(),
                signature_header: "X-SIGNATURE".into(),
            }
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": true, "c": [{"y": 1, "x": 2}]}});
        let text = serde_json::to_string(&canonical_json(&value)).unwrap();
        assert_eq!(text, r#"{"a":{"c":[{"x":2,"y":1}],"z":true},"b":1}"#);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("abcdef123456", "super-secret").with_passphrase("pw");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("super-secret"));
        assert!(!printed.contains("abcdef123456"));
        assert!(!printed.contains("\"pw\""));
        assert!(printed.contains("abcd"));
    }

    #[test]
    #[serial]
    fn test_credentials_from_env() {
        std::env::set_var("XCORE_TEST_API_KEY", "key-1");
        std::env::set_var("XCORE_TEST_API_SECRET", "secret-1");
        std::env::set_var("XCORE_TEST_PASSPHRASE", "");
        std::env::remove_var("XCORE_TEST_ACCOUNT");

        let creds = Credentials::from_env("XCORE_TEST").unwrap();
        assert_eq!(creds.api_key, "key-1");
        assert_eq!(creds.secret, "secret-1");
        assert_eq!(creds.passphrase, None);
        assert_eq!(creds.account, None);

        std::env::remove_var("XCORE_TEST_API_KEY");
        std::env::remove_var("XCORE_TEST_API_SECRET");
        std::env::remove_var("XCORE_TEST_PASSPHRASE");
    }

    #[test]
    #[serial]
    fn test_credentials_from_env_absent() {
        std::env::remove_var("XCORE_ABSENT_API_KEY");
        std::env::remove_var("XCORE_ABSENT_API_SECRET");
        assert!(Credentials::from_env("XCORE_ABSENT").is_none());
    }
}
