//! EIP-191 personal-sign strategy
//!
//! Wallet-keyed venues authenticate REST calls with a secp256k1 signature over
//! `timestamp + METHOD + path?query + body`, prefixed with
//! `"\x19Ethereum Signed Message:\n" + len`. The signer address travels in a
//! header so the exchange can recover and compare.

use ethers::signers::{LocalWallet, Signer};
use ethers::utils::hash_message;
use serde::{Deserialize, Serialize};

use crate::adapters::errors::{ExchangeError, ExchangeResult};
use crate::adapters::signing::Credentials;
use crate::adapters::traits::{SigningStrategy, Stamp};
use crate::adapters::types::{LogicalRequest, SignedRequest};

/// Header names used by [`Eip191Signer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eip191Headers {
    pub address: String,
    pub signature: String,
    pub timestamp: String,
}

impl Default for Eip191Headers {
    fn default() -> Self {
        Self {
            address: "X-SIGNER".into(),
            signature: "X-SIGNATURE".into(),
            timestamp: "X-TIMESTAMP".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Eip191Signer {
    headers: Eip191Headers,
}

impl Eip191Signer {
    pub fn new(headers: Eip191Headers) -> Self {
        Self { headers }
    }

    /// Message bytes that get personal-signed
    pub fn message(timestamp_ms: u64, request: &LogicalRequest, body: Option<&[u8]>) -> Vec<u8> {
        let query = request.query_string();
        let mut message = format!("{}{}{}", timestamp_ms, request.method, request.path);
        if !query.is_empty() {
            message.push('?');
            message.push_str(&query);
        }
        let mut bytes = message.into_bytes();
        if let Some(body) = body {
            bytes.extend_from_slice(body);
        }
        bytes
    }
}

impl SigningStrategy for Eip191Signer {
    fn name(&self) -> &'static str {
        "eip191"
    }

    fn sign(
        &self,
        request: &LogicalRequest,
        base_url: &str,
        credentials: &Credentials,
        stamp: Stamp,
    ) -> ExchangeResult<SignedRequest> {
        let wallet: LocalWallet = credentials
            .secret
            .trim()
            .parse()
            .map_err(|e| ExchangeError::authentication(format!("Invalid signing key: {}", e)))?;

        let body = request.body_bytes()?;
        let message = Self::message(stamp.timestamp_ms, request, body.as_deref());
        let signature = wallet
            .sign_hash(hash_message(&message))
            .map_err(|e| ExchangeError::authentication(format!("EIP-191 signing failed: {}", e)))?;

        // Signature should be exactly 65 bytes (r: 32, s: 32, v: 1)
        let mut sig_bytes = signature.to_vec();
        if sig_bytes.len() != 65 {
            return Err(ExchangeError::authentication(format!(
                "Invalid signature length: {} (expected 65)",
                sig_bytes.len()
            )));
        }
        // Normalize v to 27/28
        let v = sig_bytes[64];
        if v == 0 || v == 1 {
            sig_bytes[64] = v + 27;
        }

        let mut signed = SignedRequest::unsigned(request, base_url)?;
        signed.headers.insert(
            self.headers.address.clone(),
            format!("{:?}", wallet.address()).to_lowercase(),
        );
        signed.headers.insert(
            self.headers.signature.clone(),
            format!("0x{}", hex::encode(sig_bytes)),
        );
        signed
            .headers
            .insert(self.headers.timestamp.clone(), stamp.timestamp_ms.to_string());
        Ok(signed)
    }
}
