//! HTTP client for the scan API, used by the proxy.
//!
//! On a 402 the client reads the `accepts` list, picks the first network it
//! holds a wallet for, builds a payment envelope, and retries once with
//! `X-Payment`. A second 402 is terminal.

use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::payments::evm::EvmWallet;
use crate::payments::solana::SolanaWallet;
use crate::payments::{is_solana_network, networks, PaymentRequirements};
use crate::scanner::types::ScanResult;

const SCAN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan request failed: {0}")]
    Transport(String),

    #[error("payment required: {0}")]
    Payment(String),

    #[error("scan API error: {0}")]
    Api(String),
}

#[derive(Debug, Serialize)]
struct ScanRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    source_url: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    source_type: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    content_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct PaymentRequiredResponse {
    #[serde(default)]
    accepts: Vec<PaymentRequirements>,
    /// Older servers send a single object instead of an accepts list.
    #[serde(default)]
    payment_requirements: Option<PaymentRequirements>,
}

/// Client for the scan API. Long-lived; wallets are attached at startup.
pub struct ScannerClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
    evm_wallet: Option<Arc<EvmWallet>>,
    solana_wallet: Option<Arc<SolanaWallet>>,
}

impl ScannerClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ScanError> {
        // Redirects are disabled so payment headers can never leak to an
        // attacker-controlled Location.
        let http = reqwest::Client::builder()
            .timeout(SCAN_TIMEOUT)
            .redirect(Policy::none())
            .build()
            .map_err(|e| ScanError::Transport(format!("client construction: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
            evm_wallet: None,
            solana_wallet: None,
        })
    }

    pub fn with_evm_wallet(mut self, wallet: Arc<EvmWallet>) -> Self {
        self.evm_wallet = Some(wallet);
        self
    }

    pub fn with_solana_wallet(mut self, wallet: Arc<SolanaWallet>) -> Self {
        self.solana_wallet = Some(wallet);
        self
    }

    /// Scan external content for prompt injection, paying if asked to.
    pub async fn scan_content(
        &self,
        content: &[u8],
        source_url: &str,
        content_type: &str,
    ) -> Result<ScanResult, ScanError> {
        let text = String::from_utf8_lossy(content);
        let request = ScanRequest {
            text: &text,
            source_url,
            source_type: "http_proxy",
            content_type,
        };

        self.scan_with_payment("/v1/scan/content", &request).await
    }

    async fn scan_with_payment(
        &self,
        endpoint: &str,
        request: &ScanRequest<'_>,
    ) -> Result<ScanResult, ScanError> {
        // First attempt without payment; credit or dev mode may cover it.
        let (result, status, requirements) = self.scan(endpoint, request, None).await?;
        if status != StatusCode::PAYMENT_REQUIRED {
            return result.ok_or_else(|| ScanError::Api("empty scan response".into()));
        }

        let requirements = requirements
            .ok_or_else(|| ScanError::Payment("402 without payment requirements".into()))?;

        let header = self.create_payment(&requirements).await?;

        let (result, status, _) = self.scan(endpoint, request, Some(&header)).await?;
        if status == StatusCode::PAYMENT_REQUIRED {
            return Err(ScanError::Payment(
                "payment was rejected - insufficient funds or invalid payment".into(),
            ));
        }

        result.ok_or_else(|| ScanError::Api("empty scan response".into()))
    }

    async fn scan(
        &self,
        endpoint: &str,
        request: &ScanRequest<'_>,
        payment_header: Option<&str>,
    ) -> Result<(Option<ScanResult>, StatusCode, Option<PaymentRequirements>), ScanError> {
        let mut req = self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .json(request);

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(header) = payment_header {
            req = req.header("X-Payment", header);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ScanError::Transport(format!("request failed: {e}")))?;
        let status = resp.status();

        if status == StatusCode::PAYMENT_REQUIRED {
            let body: PaymentRequiredResponse = resp
                .json()
                .await
                .map_err(|e| ScanError::Payment(format!("unparseable 402 response: {e}")))?;
            return Ok((None, status, self.select_payment_option(body)));
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScanError::Api(format!("scan failed: {status} - {body}")));
        }

        let result: ScanResult = resp
            .json()
            .await
            .map_err(|e| ScanError::Api(format!("bad scan response: {e}")))?;
        Ok((Some(result), status, None))
    }

    /// Pick the first 402 option the client can pay for. Falls back to the
    /// first option so the caller gets a concrete "no wallet for network X"
    /// error instead of a vague one.
    fn select_payment_option(
        &self,
        response: PaymentRequiredResponse,
    ) -> Option<PaymentRequirements> {
        if !response.accepts.is_empty() {
            for option in &response.accepts {
                if self.has_wallet_for_network(&option.network) {
                    return Some(option.clone());
                }
            }
            return response.accepts.into_iter().next();
        }
        response.payment_requirements
    }

    fn has_wallet_for_network(&self, network: &str) -> bool {
        if !networks::is_network_supported(network) {
            return false;
        }
        if is_solana_network(network) {
            self.solana_wallet.is_some()
        } else {
            self.evm_wallet.is_some()
        }
    }

    async fn create_payment(&self, req: &PaymentRequirements) -> Result<String, ScanError> {
        if is_solana_network(&req.network) {
            let wallet = self.solana_wallet.as_ref().ok_or_else(|| {
                ScanError::Payment(format!("no Solana wallet configured for {}", req.network))
            })?;
            wallet
                .create_payment(req)
                .await
                .map_err(|e| ScanError::Payment(format!("failed to create payment: {e}")))
        } else {
            let wallet = self.evm_wallet.as_ref().ok_or_else(|| {
                ScanError::Payment(format!("no EVM wallet configured for {}", req.network))
            })?;
            wallet
                .create_payment(req)
                .map_err(|e| ScanError::Payment(format!("failed to create payment: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PRIVATE_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn option(network: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: "x402".into(),
            network: network.into(),
            recipient: "0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20".into(),
            amount: "1000".into(),
            currency: "USDC".into(),
            facilitator_url: networks::DEFAULT_FACILITATOR_URL.into(),
            description: "Scan".into(),
            fee_payer: None,
        }
    }

    #[test]
    fn test_selects_option_matching_wallet() {
        let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
        let client = ScannerClient::new("http://localhost:9000", None)
            .unwrap()
            .with_evm_wallet(Arc::new(wallet));

        let response = PaymentRequiredResponse {
            accepts: vec![option("solana"), option("base-sepolia")],
            payment_requirements: None,
        };
        let picked = client.select_payment_option(response).unwrap();
        assert_eq!(picked.network, "base-sepolia");
    }

    #[test]
    fn test_falls_back_to_first_option_without_wallet() {
        let client = ScannerClient::new("http://localhost:9000", None).unwrap();
        let response = PaymentRequiredResponse {
            accepts: vec![option("solana"), option("base")],
            payment_requirements: None,
        };
        let picked = client.select_payment_option(response).unwrap();
        assert_eq!(picked.network, "solana");
    }

    #[test]
    fn test_legacy_payment_requirements_field() {
        let client = ScannerClient::new("http://localhost:9000", None).unwrap();
        let response = PaymentRequiredResponse {
            accepts: vec![],
            payment_requirements: Some(option("base")),
        };
        let picked = client.select_payment_option(response).unwrap();
        assert_eq!(picked.network, "base");
    }
}
