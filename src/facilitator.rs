//! Client for the remote x402 facilitator.
//!
//! The facilitator is authoritative for on-chain validity: `/verify` answers
//! whether an envelope is good, `/settle` moves the funds and returns the
//! settlement id. A 200 with `valid=false` is a deterministic rejection; any
//! non-200 is a transient transport failure the settlement worker may retry.

use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::payments::PaymentPayload;

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FacilitatorError {
    /// The facilitator examined the payment and said no. Not retried.
    #[error("payment rejected: {0}")]
    Rejected(String),

    /// Network failure or non-200 status. Retriable.
    #[error("facilitator transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Serialize)]
struct FacilitatorRequest<'a> {
    payment: &'a str,
    network: &'a str,
    amount: &'a str,
    receiver: &'a str,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Result of a successful `/settle` call.
#[derive(Debug, Clone, Deserialize)]
pub struct Settlement {
    pub payment_id: String,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

/// HTTP/JSON client for a facilitator service. Long-lived and reusable;
/// never mutated after construction.
#[derive(Debug, Clone)]
pub struct FacilitatorClient {
    base_url: String,
    verify_client: reqwest::Client,
    settle_client: reqwest::Client,
}

impl FacilitatorClient {
    /// Build a client for the given base URL.
    ///
    /// Redirects are never followed: a redirect would re-send the payment
    /// header to whatever URL the responder chose.
    pub fn new(base_url: &str) -> Result<Self, FacilitatorError> {
        let build = |timeout: Duration| {
            reqwest::Client::builder()
                .timeout(timeout)
                .redirect(Policy::none())
                .build()
                .map_err(|e| FacilitatorError::Transport(format!("client construction: {e}")))
        };

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            verify_client: build(VERIFY_TIMEOUT)?,
            settle_client: build(SETTLE_TIMEOUT)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `/verify`. `Ok(())` means the envelope is spendable.
    pub async fn verify(
        &self,
        payment_header: &str,
        payload: &PaymentPayload,
    ) -> Result<(), FacilitatorError> {
        let body = FacilitatorRequest {
            payment: payment_header,
            network: &payload.network,
            amount: &payload.amount,
            receiver: &payload.receiver,
            token: &payload.token_address,
        };

        let resp = self
            .verify_client
            .post(format!("{}/verify", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| FacilitatorError::Transport(format!("verify call failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(FacilitatorError::Transport(format!(
                "verify returned {}",
                resp.status()
            )));
        }

        let result: VerifyResponse = resp
            .json()
            .await
            .map_err(|e| FacilitatorError::Transport(format!("bad verify response: {e}")))?;

        if !result.valid {
            return Err(FacilitatorError::Rejected(
                result.reason.unwrap_or_else(|| "no reason given".into()),
            ));
        }

        Ok(())
    }

    /// POST `/settle`. Returns the facilitator's opaque settlement id.
    pub async fn settle(
        &self,
        payment_header: &str,
        payload: &PaymentPayload,
    ) -> Result<Settlement, FacilitatorError> {
        let body = FacilitatorRequest {
            payment: payment_header,
            network: &payload.network,
            amount: &payload.amount,
            receiver: &payload.receiver,
            token: &payload.token_address,
        };

        let resp = self
            .settle_client
            .post(format!("{}/settle", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| FacilitatorError::Transport(format!("settle call failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(FacilitatorError::Transport(format!(
                "settle returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| FacilitatorError::Transport(format!("bad settle response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = FacilitatorClient::new("https://x402.org/facilitator/").unwrap();
        assert_eq!(client.base_url(), "https://x402.org/facilitator");
    }

    #[tokio::test]
    async fn test_unreachable_facilitator_is_transport_error() {
        let client = FacilitatorClient::new("http://127.0.0.1:1").unwrap();
        let payload = crate::payments::PaymentPayload {
            network: "base".into(),
            scheme: "x402".into(),
            payer: String::new(),
            receiver: String::new(),
            token_address: String::new(),
            amount: "1000".into(),
            timestamp: 0,
            nonce: crate::payments::generate_nonce(),
            signature: None,
            transaction: None,
        };
        let err = client.verify("x402;e30=", &payload).await.unwrap_err();
        assert!(matches!(err, FacilitatorError::Transport(_)));
    }
}
