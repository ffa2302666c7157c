//! EVM payment envelopes: EIP-712 typed-data signing and recovery.
//!
//! The signed message binds `{receiver, tokenAddress, amount, timestamp,
//! nonce}` under the `x402` domain with the receiver as verifying contract,
//! so an envelope cannot be replayed against a different sink address.

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::{Signature, SignerSync};
use alloy::sol;
use alloy::sol_types::{eip712_domain, Eip712Domain, SolStruct};

use crate::payments::envelope::{encode_payment_header, generate_nonce, PaymentPayload};
use crate::payments::networks::{self, NetworkKind};
use crate::payments::{PaymentError, PaymentRequirements, PaymentResult};

sol! {
    /// The EIP-712 message a payer signs.
    #[derive(Debug)]
    struct Payment {
        address receiver;
        address tokenAddress;
        uint256 amount;
        uint256 timestamp;
        string nonce;
    }
}

fn payment_domain(chain_id: u64, receiver: Address) -> Eip712Domain {
    eip712_domain! {
        name: "x402",
        version: "1",
        chain_id: chain_id,
        verifying_contract: receiver,
    }
}

fn parse_address(s: &str, what: &str) -> PaymentResult<Address> {
    s.parse::<Address>()
        .map_err(|e| PaymentError::InvalidFormat(format!("bad {what} address {s:?}: {e}")))
}

fn typed_payment(payload: &PaymentPayload) -> PaymentResult<(Payment, Eip712Domain)> {
    let receiver = parse_address(&payload.receiver, "receiver")?;
    let token = parse_address(&payload.token_address, "token")?;
    let amount: U256 = payload
        .amount
        .parse()
        .map_err(|_| PaymentError::InvalidFormat(format!("bad amount {:?}", payload.amount)))?;
    let chain_id = networks::chain_id(&payload.network)?;

    let message = Payment {
        receiver,
        tokenAddress: token,
        amount,
        timestamp: U256::from(payload.timestamp as u64),
        nonce: payload.nonce.clone(),
    };
    Ok((message, payment_domain(chain_id, receiver)))
}

/// An EVM signing wallet bound to one network.
#[derive(Debug, Clone)]
pub struct EvmWallet {
    signer: PrivateKeySigner,
    network: String,
}

impl EvmWallet {
    /// Create a wallet from a hex private key (with or without 0x prefix).
    /// The key is never logged.
    pub fn from_private_key(private_key_hex: &str, network: &str) -> PaymentResult<Self> {
        let cfg = networks::network_config(network)
            .ok_or_else(|| PaymentError::UnsupportedNetwork(network.to_string()))?;
        if cfg.kind != NetworkKind::Evm {
            return Err(PaymentError::UnsupportedNetwork(format!(
                "{network} is not an EVM network"
            )));
        }

        let key_hex = private_key_hex.strip_prefix("0x").unwrap_or(private_key_hex);
        let signer: PrivateKeySigner = key_hex
            .parse()
            .map_err(|e| PaymentError::Wallet(format!("invalid private key: {e}")))?;

        tracing::info!(address = %signer.address(), network, "EVM wallet initialized");

        Ok(Self {
            signer,
            network: network.to_string(),
        })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Build and sign an `X-Payment` header satisfying the given 402 option.
    pub fn create_payment(&self, req: &PaymentRequirements) -> PaymentResult<String> {
        let cfg = networks::network_config(&req.network)
            .ok_or_else(|| PaymentError::UnsupportedNetwork(req.network.clone()))?;

        let mut payload = PaymentPayload {
            network: req.network.clone(),
            scheme: "x402".into(),
            payer: self.signer.address().to_string(),
            receiver: req.recipient.clone(),
            token_address: cfg.token_address.to_string(),
            amount: req.amount.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            nonce: generate_nonce(),
            signature: None,
            transaction: None,
        };

        let (message, domain) = typed_payment(&payload)?;
        let hash = message.eip712_signing_hash(&domain);
        let signature = self
            .signer
            .sign_hash_sync(&hash)
            .map_err(|e| PaymentError::Wallet(format!("signing failed: {e}")))?;

        payload.signature = Some(format!("0x{}", hex::encode(signature.as_bytes())));
        encode_payment_header(&payload)
    }
}

/// Verify that an EVM envelope's signature recovers to its declared payer.
pub fn verify_payment_signature(payload: &PaymentPayload) -> PaymentResult<()> {
    let sig_hex = payload
        .signature
        .as_deref()
        .ok_or_else(|| PaymentError::Signature("missing signature".into()))?;

    let sig_bytes = hex::decode(sig_hex.strip_prefix("0x").unwrap_or(sig_hex))
        .map_err(|e| PaymentError::Signature(format!("bad signature hex: {e}")))?;
    if sig_bytes.len() != 65 {
        return Err(PaymentError::Signature(format!(
            "signature must be 65 bytes, got {}",
            sig_bytes.len()
        )));
    }

    let signature = Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| PaymentError::Signature(format!("unparseable signature: {e}")))?;

    let (message, domain) = typed_payment(payload)?;
    let hash = message.eip712_signing_hash(&domain);

    let recovered = signature
        .recover_address_from_prehash(&hash)
        .map_err(|e| PaymentError::Signature(format!("recovery failed: {e}")))?;

    let expected = parse_address(&payload.payer, "payer")?;
    if recovered != expected {
        return Err(PaymentError::Signature(format!(
            "recovered {recovered}, expected {expected}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::envelope::parse_payment_header;
    use crate::payments::networks::DEFAULT_FACILITATOR_URL;

    // Anvil's first test account
    const TEST_PRIVATE_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "x402".into(),
            network: "base-sepolia".into(),
            recipient: "0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20".into(),
            amount: "1000".into(),
            currency: "USDC".into(),
            facilitator_url: DEFAULT_FACILITATOR_URL.into(),
            description: "Scan".into(),
            fee_payer: None,
        }
    }

    #[test]
    fn test_wallet_from_private_key() {
        let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
        assert_eq!(wallet.address().to_string().to_lowercase(), TEST_ADDRESS);

        let with_prefix =
            EvmWallet::from_private_key(&format!("0x{TEST_PRIVATE_KEY}"), "base").unwrap();
        assert_eq!(with_prefix.address(), wallet.address());
    }

    #[test]
    fn test_wallet_rejects_bad_inputs() {
        assert!(EvmWallet::from_private_key("not-a-key", "base").is_err());
        assert!(EvmWallet::from_private_key(TEST_PRIVATE_KEY, "solana").is_err());
        assert!(EvmWallet::from_private_key(TEST_PRIVATE_KEY, "unknown").is_err());
    }

    #[test]
    fn test_create_and_verify_payment() {
        let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
        let header = wallet.create_payment(&requirements()).unwrap();

        let payload = parse_payment_header(&header).unwrap();
        assert_eq!(payload.network, "base-sepolia");
        assert_eq!(payload.amount, "1000");
        assert_eq!(payload.payer.to_lowercase(), TEST_ADDRESS);
        assert_eq!(payload.nonce.len(), 64);

        verify_payment_signature(&payload).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_amount() {
        let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
        let header = wallet.create_payment(&requirements()).unwrap();

        let mut payload = parse_payment_header(&header).unwrap();
        payload.amount = "999999".into();
        assert!(verify_payment_signature(&payload).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_payer() {
        let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
        let header = wallet.create_payment(&requirements()).unwrap();

        let mut payload = parse_payment_header(&header).unwrap();
        payload.payer = "0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20".into();
        assert!(verify_payment_signature(&payload).is_err());
    }

    #[test]
    fn test_verify_rejects_missing_signature() {
        let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
        let header = wallet.create_payment(&requirements()).unwrap();

        let mut payload = parse_payment_header(&header).unwrap();
        payload.signature = None;
        assert!(matches!(
            verify_payment_signature(&payload),
            Err(PaymentError::Signature(_))
        ));
    }
}
