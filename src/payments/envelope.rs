//! The `X-Payment` wire format: `x402;<base64(json-payload)>`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::payments::{PaymentError, PaymentResult};

/// The JSON payload carried inside an `X-Payment` header.
///
/// Exactly one of `signature` (EVM) or `transaction` (Solana) is present;
/// parsing stores whichever field arrived and leaves the other empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub network: String,
    pub scheme: String,
    pub payer: String,
    pub receiver: String,
    #[serde(rename = "tokenAddress")]
    pub token_address: String,
    /// Decimal string of on-chain atomic units.
    pub amount: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// 64 hex chars (32 random bytes).
    pub nonce: String,
    /// 0x-prefixed 65-byte hex signature (EVM path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Base64 of a partially-signed Solana transaction (Solana path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}

/// One payment option from a 402 response `accepts` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub recipient: String,
    pub amount: String,
    pub currency: String,
    pub facilitator_url: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_payer: Option<String>,
}

/// Parse an `X-Payment` header. Any deviation from the wire format is an
/// [`PaymentError::InvalidFormat`].
pub fn parse_payment_header(header: &str) -> PaymentResult<PaymentPayload> {
    let (scheme, encoded) = header
        .split_once(';')
        .ok_or_else(|| PaymentError::InvalidFormat("missing ';' separator".into()))?;

    if scheme != "x402" {
        return Err(PaymentError::InvalidFormat(format!(
            "unknown scheme {scheme:?}"
        )));
    }

    let payload_json = BASE64
        .decode(encoded)
        .map_err(|e| PaymentError::InvalidFormat(format!("bad base64 payload: {e}")))?;

    serde_json::from_slice(&payload_json)
        .map_err(|e| PaymentError::InvalidFormat(format!("bad payload json: {e}")))
}

/// Serialize a payload into the `x402;<base64-json>` header value.
pub fn encode_payment_header(payload: &PaymentPayload) -> PaymentResult<String> {
    let json = serde_json::to_vec(payload)
        .map_err(|e| PaymentError::InvalidFormat(format!("cannot encode payload: {e}")))?;
    Ok(format!("x402;{}", BASE64.encode(json)))
}

/// Generate a payment nonce: 32 cryptographically secure random bytes,
/// hex-encoded. 256 bits keeps birthday collisions negligible at any
/// realistic issuance rate.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
