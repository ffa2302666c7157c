//! The API server's HTTP surface.
//!
//! Wires the scan endpoints behind the payment router, plus API-key
//! management and the billing webhook. Pure routing and state here;
//! behavior lives in the handler modules and gates.

pub mod api_keys;
pub mod scan;
pub mod webhook;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::billing::MeterReporter;
use crate::config::ApiConfig;
use crate::facilitator::FacilitatorClient;
use crate::gate;
use crate::scanner::ScanEngine;
use crate::store::Db;
use crate::usdc::MicroUsdc;

/// Application state injected into handlers and gates.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub db: Db,
    pub facilitator: FacilitatorClient,
    pub engine: Arc<ScanEngine>,
    pub meter: Option<Arc<MeterReporter>>,
}

/// Build the axum application.
pub fn build_router(state: AppState) -> Router {
    let gated = |price: MicroUsdc| {
        middleware::from_fn_with_state(
            (state.clone(), price),
            gate::payment_router::payment_router_mw,
        )
    };

    let prices = &state.config;
    let scan_routes = Router::new()
        .route(
            "/v1/scan/content",
            post(scan::scan_content).route_layer(gated(prices.price_scan_content)),
        )
        // Deprecated alias kept for old clients.
        .route(
            "/v1/scan/input",
            post(scan::scan_content).route_layer(gated(prices.price_scan_content)),
        )
        .route(
            "/v1/scan/output",
            post(scan::scan_output).route_layer(gated(prices.price_scan_output)),
        )
        .route(
            "/v1/scan",
            post(scan::scan_unified).route_layer(gated(prices.price_scan_unified)),
        )
        .route(
            "/v1/scan/multiturn",
            post(scan::scan_multiturn).route_layer(gated(prices.price_scan_multiturn)),
        );

    let account_routes = Router::new()
        .route(
            "/v1/account/api-keys",
            post(api_keys::create_api_key).get(api_keys::list_api_keys),
        )
        .route("/v1/account/api-keys/{id}", delete(api_keys::revoke_api_key));

    Router::new()
        .merge(scan_routes)
        .merge(account_routes)
        .route("/v1/billing/webhook", post(webhook::handle_webhook))
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(gate::request_id_mw))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "healthy" }))
}
