//! Ed25519 signing over a canonical JSON body
//!
//! The secret is the hex-encoded 32-byte key seed. Requests with a body get a
//! `nonce` field and are signed over their sorted-key JSON bytes; body-less
//! requests get a `nonce` query parameter and are signed over
//! `METHOD path?query`.

use ed25519_dalek::{Signer, SigningKey};

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::signing::{canonical_json, Credentials};
use crate::adapters::traits::{SigningStrategy, Stamp};
use crate::adapters::types::{build_url, encode_query, LogicalRequest, SignedRequest};

#[derive(Debug, Clone)]
pub struct Ed25519Signer {
    key_header: String,
    signature_header: String,
}

impl Ed25519Signer {
    pub fn new(key_header: impl Into<String>, signature_header: impl Into<String>) -> Self {
        Self {
            key_header: key_header.into(),
            signature_header: signature_header.into(),
        }
    }

    fn signing_key(secret: &str) -> ExchangeResult<SigningKey> {
        let seed = hex::decode(secret.trim().trim_start_matches("0x"))
            .map_err(|e| ExchangeError::authentication(format!("Invalid Ed25519 key hex: {}", e)))?;
        let seed: [u8; 32] = seed.as_slice().try_into().map_err(|_| {
            ExchangeError::authentication(format!(
                "Invalid Ed25519 key length: {} bytes (expected 32)",
                seed.len()
            ))
        })?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

impl SigningStrategy for Ed25519Signer {
    fn name(&self) -> &'static str {
        "ed25519"
    }

    fn uses_nonce(&self) -> bool {
        true
    }

    fn sign(
        &self,
        request: &LogicalRequest,
        base_url: &str,
        credentials: &Credentials,
        stamp: Stamp,
    ) -> ExchangeResult<SignedRequest> {
        if credentials.secret.is_empty() {
            return Err(ExchangeError::authentication("ed25519: signing key is empty"));
        }
        let key = Self::signing_key(&credentials.secret)?;
        let nonce = stamp.nonce.unwrap_or(stamp.timestamp_ms);

        let (url, message, body) = match &request.body {
            Some(serde_json::Value::Object(fields)) => {
                let mut fields = fields.clone();
                fields
                    .entry("nonce".to_string())
                    .or_insert_with(|| serde_json::Value::from(nonce));
                let canonical = canonical_json(&serde_json::Value::Object(fields));
                let bytes = serde_json::to_vec(&canonical).map_err(|e| {
                    ExchangeError::invalid_request(format!("Unserializable body: {}", e))
                })?;
                let url = build_url(base_url, &request.path, &request.query_string());
                (url, bytes.clone(), Some(bytes))
            }
            Some(_) => {
                return Err(ExchangeError::invalid_request(
                    "ed25519 signing requires a JSON object body",
                ))
            }
            None => {
                let mut params = request.query.clone();
                params
                    .entry("nonce".to_string())
                    .or_insert_with(|| nonce.to_string());
                let query = encode_query(&params);
                let message = format!("{} {}?{}", request.method, request.path, query);
                (build_url(base_url, &request.path, &query), message.into_bytes(), None)
            }
        };

        let signature = key.sign(&message);

        let mut signed = SignedRequest {
            method: request.method,
            url,
            headers: Default::default(),
            body,
        };
        if !credentials.api_key.is_empty() {
            signed
                .headers
                .insert(self.key_header.clone(), credentials.api_key.clone());
        }
        signed
            .headers
            .insert(self.signature_header.clone(), hex::encode(signature.to_bytes()));
        if signed.body.is_some() {
            signed
                .headers
                .insert("Content-Type".to_string(), "application/json".to_string());
        }
        Ok(signed)
    }
}
