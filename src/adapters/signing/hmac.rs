//! HMAC-SHA256 signing strategies
//!
//! Two canonical-string layouts cover most centralized venues:
//! - `HmacQuerySigner`: signature over the url-encoded query (+ body),
//!   appended as the final `signature` query parameter, key in a header.
//! - `HmacHeaderSigner`: signature over `timestamp + METHOD + path?query + body`,
//!   base64-encoded into headers alongside key, timestamp and passphrase.

use base64::Engine;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::signing::Credentials;
use crate::adapters::traits::{SigningStrategy, Stamp};
use crate::adapters::types::{build_url, encode_query, LogicalRequest, SignedRequest};

type HmacSha256 = Hmac<Sha256>;

/// Raw HMAC-SHA256 digest
pub fn hmac_sha256(secret: &[u8], payload: &[u8]) -> ExchangeResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| ExchangeError::authentication(format!("Invalid HMAC key: {}", e)))?;
    mac.update(payload);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Ok(digest)
}

/// Lowercase hex HMAC-SHA256 digest
pub fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> ExchangeResult<String> {
    hmac_sha256(secret, payload).map(hex::encode)
}

fn require_key_and_secret(credentials: &Credentials, scheme: &str) -> ExchangeResult<()> {
    if credentials.api_key.is_empty() {
        return Err(ExchangeError::authentication(format!(
            "{}: API key is empty",
            scheme
        )));
    }
    if credentials.secret.is_empty() {
        return Err(ExchangeError::authentication(format!(
            "{}: API secret is empty",
            scheme
        )));
    }
    Ok(())
}

// =============================================================================
// Query Signer
// =============================================================================

#[derive(Debug, Clone)]
pub struct HmacQuerySigner {
    api_key_header: String,
    recv_window_ms: Option<u64>,
}

impl HmacQuerySigner {
    pub fn new(api_key_header: impl Into<String>, recv_window_ms: Option<u64>) -> Self {
        Self {
            api_key_header: api_key_header.into(),
            recv_window_ms,
        }
    }
}

impl SigningStrategy for HmacQuerySigner {
    fn name(&self) -> &'static str {
        "hmac_query"
    }

    fn sign(
        &self,
        request: &LogicalRequest,
        base_url: &str,
        credentials: &Credentials,
        stamp: Stamp,
    ) -> ExchangeResult<SignedRequest> {
        require_key_and_secret(credentials, self.name())?;

        // Caller-supplied timestamp/recvWindow win over computed ones
        let mut params = request.query.clone();
        params.remove("signature");
        params
            .entry("timestamp".to_string())
            .or_insert_with(|| stamp.timestamp_ms.to_string());
        if let Some(window) = self.recv_window_ms {
            params
                .entry("recvWindow".to_string())
                .or_insert_with(|| window.to_string());
        }

        let query = encode_query(&params);
        let body = request.body_bytes()?;

        let mut payload = query.clone().into_bytes();
        if let Some(bytes) = &body {
            payload.extend_from_slice(bytes);
        }
        let signature = hmac_sha256_hex(credentials.secret.as_bytes(), &payload)?;

        let signed_query = if query.is_empty() {
            format!("signature={}", signature)
        } else {
            format!("{}&signature={}", query, signature)
        };

        let mut signed = SignedRequest {
            method: request.method,
            url: build_url(base_url, &request.path, &signed_query),
            headers: Default::default(),
            body,
        };
        signed
            .headers
            .insert(self.api_key_header.clone(), credentials.api_key.clone());
        if signed.body.is_some() {
            signed
                .headers
                .insert("Content-Type".to_string(), "application/json".to_string());
        }
        Ok(signed)
    }
}

// =============================================================================
// Header Signer
// =============================================================================

/// How the header signer renders its timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// `2020-12-08T09:08:57.715Z`
    #[default]
    Iso8601,
    UnixMillis,
    UnixSeconds,
}

impl TimestampFormat {
    pub fn render(&self, timestamp_ms: u64) -> ExchangeResult<String> {
        match self {
            TimestampFormat::UnixMillis => Ok(timestamp_ms.to_string()),
            TimestampFormat::UnixSeconds => Ok((timestamp_ms / 1000).to_string()),
            TimestampFormat::Iso8601 => Utc
                .timestamp_millis_opt(timestamp_ms as i64)
                .single()
                .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
                .ok_or_else(|| {
                    ExchangeError::authentication(format!(
                        "Timestamp {} out of range",
                        timestamp_ms
                    ))
                }),
        }
    }
}

/// Header names used by [`HmacHeaderSigner`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HmacHeaderNames {
    pub key: String,
    pub sign: String,
    pub timestamp: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HmacHeaderSigner {
    headers: HmacHeaderNames,
    timestamp_format: TimestampFormat,
}

impl HmacHeaderSigner {
    pub fn new(headers: HmacHeaderNames, timestamp_format: TimestampFormat) -> Self {
        Self {
            headers,
            timestamp_format,
        }
    }

    /// Canonical pre-hash string
    pub fn prehash(timestamp: &str, request: &LogicalRequest, body: Option<&[u8]>) -> String {
        let query = request.query_string();
        let mut out = String::with_capacity(timestamp.len() + request.path.len() + query.len() + 8);
        out.push_str(timestamp);
        out.push_str(request.method.as_str());
        out.push_str(&request.path);
        if !query.is_empty() {
            out.push('?');
            out.push_str(&query);
        }
        if let Some(body) = body {
            out.push_str(&String::from_utf8_lossy(body));
        }
        out
    }
}

impl SigningStrategy for HmacHeaderSigner {
    fn name(&self) -> &'static str {
        "hmac_header"
    }

    fn sign(
        &self,
        request: &LogicalRequest,
        base_url: &str,
        credentials: &Credentials,
        stamp: Stamp,
    ) -> ExchangeResult<SignedRequest> {
        require_key_and_secret(credentials, self.name())?;

        let timestamp = self.timestamp_format.render(stamp.timestamp_ms)?;
        let body = request.body_bytes()?;
        let prehash = Self::prehash(&timestamp, request, body.as_deref());
        let digest = hmac_sha256(credentials.secret.as_bytes(), prehash.as_bytes())?;
        let signature = base64::engine::general_purpose::STANDARD.encode(digest);

        let mut signed = SignedRequest::unsigned(request, base_url)?;
        signed
            .headers
            .insert(self.headers.key.clone(), credentials.api_key.clone());
        signed.headers.insert(self.headers.sign.clone(), signature);
        signed
            .headers
            .insert(self.headers.timestamp.clone(), timestamp);

        if let Some(header) = &self.headers.passphrase {
            let passphrase = credentials
                .passphrase
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    ExchangeError::authentication(format!(
                        "{}: passphrase required but not configured",
                        self.name()
                    ))
                })?;
            signed.headers.insert(header.clone(), passphrase.to_string());
        }
        Ok(signed)
    }
}
