//! Stronghold transparent proxy.
//!
//! Reads a YAML config, binds the transparent TCP acceptor, and intercepts
//! agent traffic. Exit codes: 0 normal, 1 configuration error, 2 fatal
//! runtime error. SIGINT/SIGTERM drain and exit.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use stronghold::config::schema::{ProxyConfig, SOLANA_PRIVATE_KEY_ENV};
use stronghold::config::{load_proxy_config, EVM_PRIVATE_KEY_ENV};
use stronghold::lifecycle::{shutdown_on_signals, Shutdown};
use stronghold::observability;
use stronghold::payments::evm::EvmWallet;
use stronghold::payments::solana::SolanaWallet;
use stronghold::proxy::{CertAuthority, CertCache, ProxyServer};
use stronghold::scanner::ScannerClient;

#[derive(Parser)]
#[command(name = "stronghold-proxy")]
#[command(about = "Transparent scanning proxy for autonomous agents", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/stronghold/proxy.yaml")]
    config: PathBuf,

    /// EVM network for x402 payments made by the proxy's scan client.
    #[arg(long, default_value = "base")]
    network: String,

    /// Solana network for x402 payments made by the proxy's scan client.
    #[arg(long, default_value = "solana")]
    solana_network: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_proxy_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    observability::logging::init(&config.logging.level, &config.logging.file);

    match run(config, &cli.network, &cli.solana_network).await {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            std::process::exit(2);
        }
    }
}

async fn run(
    config: ProxyConfig,
    evm_network: &str,
    solana_network: &str,
) -> anyhow::Result<()> {
    let bind = format!("{}:{}", config.proxy.bind, config.proxy.port);
    tracing::info!(
        bind = %bind,
        api = %config.api.endpoint,
        fail_open = config.scanning.fail_open,
        "stronghold-proxy starting"
    );

    let ca = CertAuthority::load_or_create(std::path::Path::new(&config.proxy.ca_dir))
        .map_err(|e| anyhow::anyhow!("CA initialization: {e}"))?;
    let cert_cache = Arc::new(CertCache::new(ca));

    let token = (!config.api.token.is_empty()).then(|| config.api.token.clone());
    let mut scanner = ScannerClient::new(&config.api.endpoint, token)
        .map_err(|e| anyhow::anyhow!("scanner client: {e}"))?;

    // Wallets are optional: without them the proxy still scans, it just
    // cannot pay when the API answers 402.
    if let Ok(key) = std::env::var(EVM_PRIVATE_KEY_ENV) {
        match EvmWallet::from_private_key(&key, evm_network) {
            Ok(wallet) => scanner = scanner.with_evm_wallet(Arc::new(wallet)),
            Err(e) => tracing::warn!(error = %e, "ignoring invalid EVM wallet key"),
        }
    }
    if let Ok(key) = std::env::var(SOLANA_PRIVATE_KEY_ENV) {
        match SolanaWallet::from_base58(&key, solana_network) {
            Ok(wallet) => scanner = scanner.with_solana_wallet(Arc::new(wallet)),
            Err(e) => tracing::warn!(error = %e, "ignoring invalid Solana wallet key"),
        }
    }

    let server = Arc::new(ProxyServer::new(
        Arc::new(config),
        Arc::new(scanner),
        cert_cache,
    )?);

    let shutdown = Arc::new(Shutdown::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown_on_signals(&shutdown).await }
    });

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    server.run(listener, &shutdown).await;

    tracing::info!("proxy stopped");
    Ok(())
}
