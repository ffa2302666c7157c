//! Configuration management.
//!
//! # Data Flow
//! ```text
//! API server:  environment variables → ApiConfig (12-factor)
//! Proxy:       YAML file → loader.rs (parse & deserialize)
//!                  → validation.rs (semantic checks)
//!                  → ProxyConfig (validated, immutable)
//!                  → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::load_proxy_config;
pub use schema::{
    ApiConfig, ProxyConfig, ScanTypeConfig, ScanningConfig, EVM_PRIVATE_KEY_ENV,
    SOLANA_PRIVATE_KEY_ENV,
};
