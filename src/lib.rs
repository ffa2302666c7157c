//! Stronghold security gateway library.
//!
//! Two deployment surfaces share this crate:
//!
//! - the API server (`stronghold-api`), which exposes the scan endpoints
//!   behind a payment router accepting x402 micropayments or B2B API keys;
//! - the transparent proxy (`stronghold-proxy`), which intercepts agent
//!   traffic, terminates TLS with minted certificates, and scans content
//!   in-flight.

pub mod billing;
pub mod config;
pub mod error;
pub mod facilitator;
pub mod gate;
pub mod handlers;
pub mod lifecycle;
pub mod observability;
pub mod payments;
pub mod proxy;
pub mod scanner;
pub mod settlement;
pub mod store;
pub mod usdc;

pub use config::ApiConfig;
pub use lifecycle::Shutdown;
pub use usdc::MicroUsdc;
