//! Per-network payment constants.
//!
//! USDC token addresses and chain ids are fixed per network; the facilitator
//! URL is a default that deployment config may override.

use crate::payments::{PaymentError, PaymentResult};

/// Default facilitator when deployment config does not name one.
pub const DEFAULT_FACILITATOR_URL: &str = "https://x402.org/facilitator";

/// USDC contract on Base mainnet.
pub const USDC_BASE: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";
/// USDC contract on Base Sepolia.
pub const USDC_BASE_SEPOLIA: &str = "0x036CbD53842c5426634e7929541eC2318f3dCF7e";
/// USDC SPL mint on Solana mainnet.
pub const USDC_SOLANA: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
/// USDC SPL mint on Solana devnet.
pub const USDC_SOLANA_DEVNET: &str = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU";

/// Solana mainnet RPC endpoint.
pub const SOLANA_MAINNET_RPC: &str = "https://api.mainnet-beta.solana.com";
/// Solana devnet RPC endpoint.
pub const SOLANA_DEVNET_RPC: &str = "https://api.devnet.solana.com";

/// Which signing branch a network uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Evm,
    Solana,
}

/// Static configuration for one payment network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    pub network: &'static str,
    pub kind: NetworkKind,
    /// USDC token contract (EVM) or mint (Solana).
    pub token_address: &'static str,
    /// EIP-155 chain id; zero for Solana networks.
    pub chain_id: u64,
}

const NETWORKS: &[NetworkConfig] = &[
    NetworkConfig {
        network: "base",
        kind: NetworkKind::Evm,
        token_address: USDC_BASE,
        chain_id: 8453,
    },
    NetworkConfig {
        network: "base-sepolia",
        kind: NetworkKind::Evm,
        token_address: USDC_BASE_SEPOLIA,
        chain_id: 84532,
    },
    NetworkConfig {
        network: "solana",
        kind: NetworkKind::Solana,
        token_address: USDC_SOLANA,
        chain_id: 0,
    },
    NetworkConfig {
        network: "solana-devnet",
        kind: NetworkKind::Solana,
        token_address: USDC_SOLANA_DEVNET,
        chain_id: 0,
    },
];

/// Look up the configuration for a network tag.
pub fn network_config(network: &str) -> Option<&'static NetworkConfig> {
    NETWORKS.iter().find(|n| n.network == network)
}

pub fn is_network_supported(network: &str) -> bool {
    network_config(network).is_some()
}

pub fn is_solana_network(network: &str) -> bool {
    matches!(
        network_config(network),
        Some(NetworkConfig {
            kind: NetworkKind::Solana,
            ..
        })
    )
}

/// EIP-155 chain id for an EVM network. Solana networks have none.
pub fn chain_id(network: &str) -> PaymentResult<u64> {
    match network_config(network) {
        Some(cfg) if cfg.kind == NetworkKind::Evm => Ok(cfg.chain_id),
        _ => Err(PaymentError::UnsupportedNetwork(network.to_string())),
    }
}

/// Default RPC endpoint for a Solana network.
pub fn solana_rpc_url(network: &str) -> &'static str {
    if network == "solana-devnet" {
        SOLANA_DEVNET_RPC
    } else {
        SOLANA_MAINNET_RPC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id() {
        assert_eq!(chain_id("base").unwrap(), 8453);
        assert_eq!(chain_id("base-sepolia").unwrap(), 84532);
        assert!(chain_id("solana").is_err());
        assert!(chain_id("solana-devnet").is_err());
        assert!(chain_id("unknown").is_err());
    }

    #[test]
    fn test_network_kinds() {
        assert!(!is_solana_network("base"));
        assert!(is_solana_network("solana"));
        assert!(is_solana_network("solana-devnet"));
        assert!(!is_solana_network("tron"));
        assert!(is_network_supported("base-sepolia"));
        assert!(!is_network_supported(""));
    }
}
