//! Configuration schema definitions.
//!
//! The API server reads its configuration from the environment; the proxy
//! binary reads a YAML file. All types derive Serde traits and every field
//! carries a default so a minimal config works.

use serde::{Deserialize, Serialize};

use crate::usdc::MicroUsdc;

/// Environment variable holding the API server's EVM receiving key.
pub const EVM_PRIVATE_KEY_ENV: &str = "STRONGHOLD_EVM_PRIVATE_KEY";
/// Environment variable holding the proxy wallet's Solana keypair (base58).
pub const SOLANA_PRIVATE_KEY_ENV: &str = "STRONGHOLD_SOLANA_PRIVATE_KEY";

/// Configuration for the API server, sourced from the environment.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address, e.g. "0.0.0.0:8080".
    pub bind_address: String,
    /// Postgres connection string.
    pub database_url: String,
    /// Facilitator base URL.
    pub facilitator_url: String,
    /// Receiving wallet address per EVM network (empty disables the network).
    pub evm_wallet_address: String,
    /// Receiving wallet address for Solana networks.
    pub solana_wallet_address: String,
    /// Optional fee payer the facilitator designates for Solana envelopes.
    pub solana_fee_payer: Option<String>,
    /// Networks offered in 402 responses, e.g. ["base", "solana"].
    pub networks: Vec<String>,
    /// Secret for session-cookie HMAC.
    pub session_secret: String,
    /// Billing webhook shared secret.
    pub webhook_secret: String,
    /// Billing provider API endpoint for metered usage (empty disables).
    pub billing_meter_url: String,
    /// Billing provider API key.
    pub billing_api_key: String,
    /// Prometheus exporter bind address (empty disables).
    pub metrics_address: String,

    /// Route prices.
    pub price_scan_content: MicroUsdc,
    pub price_scan_output: MicroUsdc,
    pub price_scan_unified: MicroUsdc,
    pub price_scan_multiturn: MicroUsdc,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            database_url: String::new(),
            facilitator_url: crate::payments::networks::DEFAULT_FACILITATOR_URL.to_string(),
            evm_wallet_address: String::new(),
            solana_wallet_address: String::new(),
            solana_fee_payer: None,
            networks: vec!["base".to_string()],
            session_secret: String::new(),
            webhook_secret: String::new(),
            billing_meter_url: String::new(),
            billing_api_key: String::new(),
            metrics_address: String::new(),
            price_scan_content: MicroUsdc(1_000),
            price_scan_output: MicroUsdc(1_000),
            price_scan_unified: MicroUsdc(2_000),
            price_scan_multiturn: MicroUsdc(5_000),
        }
    }
}

impl ApiConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let get = |key: &str, fallback: String| std::env::var(key).unwrap_or(fallback);

        let networks = std::env::var("STRONGHOLD_NETWORKS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.networks);

        Self {
            bind_address: get("STRONGHOLD_BIND", defaults.bind_address),
            database_url: get("DATABASE_URL", defaults.database_url),
            facilitator_url: get("STRONGHOLD_FACILITATOR_URL", defaults.facilitator_url),
            evm_wallet_address: get("STRONGHOLD_EVM_WALLET", defaults.evm_wallet_address),
            solana_wallet_address: get("STRONGHOLD_SOLANA_WALLET", defaults.solana_wallet_address),
            solana_fee_payer: std::env::var("STRONGHOLD_SOLANA_FEE_PAYER").ok(),
            networks,
            session_secret: get("STRONGHOLD_SESSION_SECRET", defaults.session_secret),
            webhook_secret: get("STRONGHOLD_WEBHOOK_SECRET", defaults.webhook_secret),
            billing_meter_url: get("STRONGHOLD_BILLING_METER_URL", defaults.billing_meter_url),
            billing_api_key: get("STRONGHOLD_BILLING_API_KEY", defaults.billing_api_key),
            metrics_address: get("STRONGHOLD_METRICS_ADDRESS", defaults.metrics_address),
            price_scan_content: defaults.price_scan_content,
            price_scan_output: defaults.price_scan_output,
            price_scan_unified: defaults.price_scan_unified,
            price_scan_multiturn: defaults.price_scan_multiturn,
        }
    }

    /// The receiving wallet address for a network, if one is configured.
    pub fn wallet_for_network(&self, network: &str) -> Option<&str> {
        let address = if crate::payments::is_solana_network(network) {
            self.solana_wallet_address.as_str()
        } else {
            self.evm_wallet_address.as_str()
        };
        if address.is_empty() {
            None
        } else {
            Some(address)
        }
    }
}

/// Root configuration for the proxy binary (YAML).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub proxy: ProxySection,
    pub api: ApiSection,
    pub scanning: ScanningConfig,
    pub logging: LoggingConfig,
}

/// Listener section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySection {
    /// Port the transparent acceptor binds.
    pub port: u16,
    /// Bind address.
    pub bind: String,
    /// Directory holding the root CA material.
    pub ca_dir: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            port: 18080,
            bind: "127.0.0.1".to_string(),
            ca_dir: default_ca_dir(),
        }
    }
}

fn default_ca_dir() -> String {
    std::env::var("HOME")
        .map(|h| format!("{h}/.stronghold/ca"))
        .unwrap_or_else(|_| "/var/lib/stronghold/ca".to_string())
}

/// Scan API section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiSection {
    /// Scan API base URL.
    pub endpoint: String,
    /// Scan call timeout in seconds.
    pub timeout_secs: u64,
    /// Optional bearer token for the scan API.
    pub token: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            endpoint: "https://api.getstronghold.xyz".to_string(),
            timeout_secs: 5,
            token: String::new(),
        }
    }
}

/// Scanning behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanningConfig {
    pub content: ScanTypeConfig,
    pub output: ScanTypeConfig,
    /// When the scanner is unreachable: `true` forwards traffic unscanned,
    /// `false` blocks it. The default is fail-open: traffic keeps flowing
    /// while the scan service is down. Deployments that must never pass
    /// unscanned content set this to false.
    pub fail_open: bool,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            content: ScanTypeConfig::default(),
            output: ScanTypeConfig::default(),
            fail_open: true,
        }
    }
}

/// Per-direction scan settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanTypeConfig {
    pub enabled: bool,
    /// Action when the scanner says WARN: "warn" or "block".
    pub action_on_warn: String,
    /// Action when the scanner says BLOCK: "block" or "warn".
    pub action_on_block: String,
}

impl Default for ScanTypeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            action_on_warn: "warn".to_string(),
            action_on_block: "block".to_string(),
        }
    }
}

/// Logging section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error.
    pub level: String,
    /// Optional log file path; empty logs to stderr.
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}
