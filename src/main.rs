//! Stronghold API server.
//!
//! Exposes the scan endpoints behind the payment router (x402 micropayments
//! or B2B API keys), the billing webhook, and API-key management, with the
//! settlement worker running alongside.

use std::sync::Arc;

use stronghold::billing::MeterReporter;
use stronghold::config::ApiConfig;
use stronghold::facilitator::FacilitatorClient;
use stronghold::handlers::{build_router, AppState};
use stronghold::lifecycle::{shutdown_on_signals, Shutdown};
use stronghold::observability;
use stronghold::scanner::ScanEngine;
use stronghold::settlement::{SettlementWorker, WorkerConfig};
use stronghold::store::Db;

#[tokio::main]
async fn main() {
    let config = ApiConfig::from_env();
    observability::logging::init("info", "");

    match run(config).await {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            std::process::exit(2);
        }
    }
}

async fn run(config: ApiConfig) -> anyhow::Result<()> {
    tracing::info!(
        bind = %config.bind_address,
        facilitator = %config.facilitator_url,
        networks = ?config.networks,
        "stronghold-api starting"
    );

    if config.database_url.is_empty() {
        tracing::error!("DATABASE_URL is required");
        std::process::exit(1);
    }

    if !config.metrics_address.is_empty() {
        match config.metrics_address.parse() {
            Ok(addr) => observability::metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.metrics_address,
                error = %e,
                "failed to parse metrics address"
            ),
        }
    }

    let db = Db::connect(&config.database_url).await?;
    db.migrate().await?;
    tracing::info!("database ready");

    let facilitator = FacilitatorClient::new(&config.facilitator_url)
        .map_err(|e| anyhow::anyhow!("facilitator client: {e}"))?;
    let meter = MeterReporter::new(&config.billing_meter_url, &config.billing_api_key).map(Arc::new);

    let state = AppState {
        config: Arc::new(config.clone()),
        db: db.clone(),
        facilitator: facilitator.clone(),
        engine: Arc::new(ScanEngine::default()),
        meter,
    };

    let shutdown = Arc::new(Shutdown::new());

    // Settlement worker: retries and expirations happen regardless of
    // request traffic.
    let worker = Arc::new(SettlementWorker::new(
        db,
        facilitator,
        WorkerConfig::default(),
    ));
    let worker_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(&shutdown).await }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown_on_signals(&shutdown).await }
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "API server listening");

    let app = build_router(state);
    let mut stop = shutdown.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await?;

    // Let the worker finish its current batch.
    shutdown.trigger();
    let _ = worker_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}
