//! x402 payment envelopes.
//!
//! One envelope format, two wire shapes: EVM payments carry an EIP-712
//! signature, Solana payments carry a partially-signed SPL transfer
//! transaction. The `network` tag selects the branch.

pub mod envelope;
pub mod evm;
pub mod networks;
pub mod solana;

use thiserror::Error;

pub use envelope::{
    encode_payment_header, generate_nonce, parse_payment_header, PaymentPayload,
    PaymentRequirements,
};
pub use networks::{is_solana_network, network_config, NetworkConfig};

/// Errors from envelope construction, parsing, and verification.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The header or payload does not match the wire format.
    #[error("invalid payment format: {0}")]
    InvalidFormat(String),

    /// The network tag names no configured network.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// Signature missing, malformed, or recovering to the wrong payer.
    #[error("invalid signature: {0}")]
    Signature(String),

    /// Wallet material missing or unusable.
    #[error("wallet error: {0}")]
    Wallet(String),

    /// Chain RPC failure while building a transaction.
    #[error("rpc error: {0}")]
    Rpc(String),
}

pub type PaymentResult<T> = Result<T, PaymentError>;
