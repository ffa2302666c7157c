//! Solana payment envelopes: partially-signed SPL transfers.
//!
//! The payer builds a `TransferChecked` transaction moving USDC between the
//! associated token accounts, signs only their own slot, and ships the
//! serialized transaction inside the envelope. The facilitator (or a
//! designated fee payer) co-signs and submits.

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::Message;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::Transaction;
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::str::FromStr;

use crate::payments::envelope::{encode_payment_header, generate_nonce, PaymentPayload};
use crate::payments::networks::{self, NetworkKind};
use crate::payments::{PaymentError, PaymentRequirements, PaymentResult};

/// USDC carries 6 decimals on Solana, same as EVM.
pub const USDC_SOLANA_DECIMALS: u8 = 6;

const COMPUTE_UNIT_LIMIT: u32 = 200_000;
const COMPUTE_UNIT_PRICE: u64 = 1;

fn parse_pubkey(s: &str, what: &str) -> PaymentResult<Pubkey> {
    Pubkey::from_str(s)
        .map_err(|e| PaymentError::InvalidFormat(format!("bad {what} pubkey {s:?}: {e}")))
}

/// An Ed25519 signing wallet bound to one Solana network.
pub struct SolanaWallet {
    keypair: Keypair,
    network: String,
    rpc_url: String,
}

impl SolanaWallet {
    /// Load a wallet from a base58-encoded 64-byte keypair.
    pub fn from_base58(private_key_base58: &str, network: &str) -> PaymentResult<Self> {
        let cfg = networks::network_config(network)
            .ok_or_else(|| PaymentError::UnsupportedNetwork(network.to_string()))?;
        if cfg.kind != NetworkKind::Solana {
            return Err(PaymentError::UnsupportedNetwork(format!(
                "{network} is not a Solana network"
            )));
        }

        let bytes = bs58::decode(private_key_base58)
            .into_vec()
            .map_err(|e| PaymentError::Wallet(format!("invalid base58 private key: {e}")))?;
        let keypair = Keypair::from_bytes(&bytes)
            .map_err(|e| PaymentError::Wallet(format!("invalid keypair bytes: {e}")))?;

        tracing::info!(address = %keypair.pubkey(), network, "Solana wallet initialized");

        Ok(Self {
            keypair,
            network: network.to_string(),
            rpc_url: networks::solana_rpc_url(network).to_string(),
        })
    }

    /// Generate a fresh wallet. Used by tests and first-run provisioning.
    pub fn generate(network: &str) -> PaymentResult<Self> {
        let keypair = Keypair::new();
        let encoded = bs58::encode(keypair.to_bytes()).into_string();
        Self::from_base58(&encoded, network)
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn address_string(&self) -> String {
        self.keypair.pubkey().to_string()
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Export the keypair as base58. Never logged.
    pub fn export_base58(&self) -> String {
        bs58::encode(self.keypair.to_bytes()).into_string()
    }

    /// Build and sign an `X-Payment` header satisfying the given 402 option.
    /// Fetches a recent blockhash from the network RPC.
    pub async fn create_payment(&self, req: &PaymentRequirements) -> PaymentResult<String> {
        let client = RpcClient::new(self.rpc_url.clone());
        let blockhash = client
            .get_latest_blockhash()
            .await
            .map_err(|e| PaymentError::Rpc(format!("failed to get blockhash: {e}")))?;

        self.create_payment_with_blockhash(req, blockhash)
    }

    /// Deterministic half of [`create_payment`](Self::create_payment);
    /// everything except the blockhash fetch.
    pub fn create_payment_with_blockhash(
        &self,
        req: &PaymentRequirements,
        blockhash: Hash,
    ) -> PaymentResult<String> {
        let cfg = networks::network_config(&req.network)
            .ok_or_else(|| PaymentError::UnsupportedNetwork(req.network.clone()))?;
        if cfg.kind != NetworkKind::Solana {
            return Err(PaymentError::UnsupportedNetwork(format!(
                "{} is not a Solana network",
                req.network
            )));
        }

        let amount: u64 = req
            .amount
            .parse()
            .map_err(|_| PaymentError::InvalidFormat(format!("bad amount {:?}", req.amount)))?;

        let tx_base64 = self.build_transfer_transaction(req, cfg.token_address, amount, blockhash)?;

        let payload = PaymentPayload {
            network: req.network.clone(),
            scheme: "x402".into(),
            payer: self.address_string(),
            receiver: req.recipient.clone(),
            token_address: cfg.token_address.to_string(),
            amount: req.amount.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            nonce: generate_nonce(),
            signature: None,
            transaction: Some(tx_base64),
        };

        encode_payment_header(&payload)
    }

    /// Construct the SPL transfer, partially sign it with the payer key, and
    /// serialize to base64.
    fn build_transfer_transaction(
        &self,
        req: &PaymentRequirements,
        mint: &str,
        amount: u64,
        blockhash: Hash,
    ) -> PaymentResult<String> {
        let payer = self.keypair.pubkey();
        let mint = parse_pubkey(mint, "mint")?;
        let recipient = parse_pubkey(&req.recipient, "recipient")?;

        let source_ata = get_associated_token_address(&payer, &mint);
        let dest_ata = get_associated_token_address(&recipient, &mint);

        let mut instructions: Vec<Instruction> = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(COMPUTE_UNIT_LIMIT),
            ComputeBudgetInstruction::set_compute_unit_price(COMPUTE_UNIT_PRICE),
            create_associated_token_account_idempotent(&payer, &recipient, &mint, &spl_token::id()),
            spl_token::instruction::transfer_checked(
                &spl_token::id(),
                &source_ata,
                &mint,
                &dest_ata,
                &payer,
                &[],
                amount,
                USDC_SOLANA_DECIMALS,
            )
            .map_err(|e| PaymentError::Wallet(format!("transfer instruction: {e}")))?,
        ];

        // Random memo so two otherwise-identical transfers never share a
        // transaction signature.
        let mut memo_nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut memo_nonce);
        instructions.push(spl_memo::build_memo(
            format!("x402:{}", hex::encode(memo_nonce)).as_bytes(),
            &[&payer],
        ));

        // The facilitator may designate a fee payer; otherwise the payer
        // fronts the fee itself.
        let fee_payer = match req.fee_payer.as_deref() {
            Some(fp) if !fp.is_empty() => parse_pubkey(fp, "fee payer")?,
            _ => payer,
        };

        let message = Message::new_with_blockhash(&instructions, Some(&fee_payer), &blockhash);
        let mut tx = Transaction::new_unsigned(message);
        tx.partial_sign(&[&self.keypair], blockhash);

        let bytes = bincode::serialize(&tx)
            .map_err(|e| PaymentError::Wallet(format!("transaction serialization: {e}")))?;
        Ok(BASE64.encode(bytes))
    }
}

/// Verify that the embedded transaction carries a valid signature from the
/// declared payer over the exact message that will be submitted.
pub fn verify_partial_signature(payload: &PaymentPayload) -> PaymentResult<()> {
    let tx_base64 = payload
        .transaction
        .as_deref()
        .ok_or_else(|| PaymentError::Signature("missing transaction".into()))?;

    let tx_bytes = BASE64
        .decode(tx_base64)
        .map_err(|e| PaymentError::InvalidFormat(format!("bad transaction base64: {e}")))?;
    let tx: Transaction = bincode::deserialize(&tx_bytes)
        .map_err(|e| PaymentError::InvalidFormat(format!("bad transaction encoding: {e}")))?;

    let payer = parse_pubkey(&payload.payer, "payer")?;
    let num_signers = tx.message.header.num_required_signatures as usize;

    let signer_index = tx
        .message
        .account_keys
        .iter()
        .take(num_signers)
        .position(|key| *key == payer)
        .ok_or_else(|| PaymentError::Signature("payer is not a transaction signer".into()))?;

    let signature = tx
        .signatures
        .get(signer_index)
        .ok_or_else(|| PaymentError::Signature("missing payer signature slot".into()))?;

    if !signature.verify(payer.as_ref(), &tx.message_data()) {
        return Err(PaymentError::Signature(
            "payer signature does not verify".into(),
        ));
    }

    Ok(())
}
