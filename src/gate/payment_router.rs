//! The per-route payment gate.
//!
//! Routes payment handling between x402 crypto payments (B2C) and API-key
//! billing (B2B):
//!
//! 1. `X-Payment` header → atomic payment middleware
//! 2. `Authorization: Bearer sk_live_…` → credit deduction, metered fallback
//! 3. neither → 402 listing the accepted payment options

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::GatewayError;
use crate::gate::api_key;
use crate::gate::atomic;
use crate::gate::request_id::RequestId;
use crate::handlers::AppState;
use crate::payments::{is_solana_network, PaymentRequirements};
use crate::store::usage::UsageLog;
use crate::usdc::MicroUsdc;

pub async fn payment_router_mw(
    State((state, price)): State<(AppState, MicroUsdc)>,
    req: Request,
    next: Next,
) -> Response {
    // Path 1: x402 crypto payment
    if let Some(header) = req.headers().get("X-Payment") {
        let header = match header.to_str() {
            Ok(h) => h.to_string(),
            Err(_) => {
                return GatewayError::InvalidFormat("X-Payment header is not ASCII".into())
                    .into_response()
            }
        };
        return atomic::atomic_payment(&state, price, &header, req, next).await;
    }

    // Path 2: B2B API key
    if let Some(auth) = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if api_key::looks_like_api_key(auth) {
            return handle_api_key_payment(&state, price, req, next).await;
        }
    }

    // Path 3: nothing presented → tell the caller how to pay
    payment_required_response(&state, price)
}

async fn handle_api_key_payment(
    state: &AppState,
    price: MicroUsdc,
    mut req: Request,
    next: Next,
) -> Response {
    let (account, key) = match api_key::authenticate(&state.db, req.headers()).await {
        Ok(pair) => pair,
        Err(e) => return e.into_response(),
    };

    req.extensions_mut().insert(api_key::AuthContext {
        account_id: account.id,
        api_key_id: key.id,
    });

    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    let endpoint = req.uri().path().to_string();
    let method = req.method().to_string();

    // The conditional UPDATE is the sole authority on credit spending.
    let deducted = match state.db.deduct_balance(account.id, price).await {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(account_id = %account.id, error = %e, "failed to deduct balance");
            return GatewayError::Internal(e.into()).into_response();
        }
    };

    if deducted {
        log_usage(state, &account.id, &request_id, &endpoint, &method, price, "credits").await;
        return next.run(req).await;
    }

    // Insufficient credits: fall back to metered billing when the account
    // has a billing customer.
    let Some(customer_id) = account.stripe_customer_id.clone().filter(|c| !c.is_empty()) else {
        return (
            StatusCode::PAYMENT_REQUIRED,
            Json(serde_json::json!({
                "error": "Insufficient credits",
                "message": "Your credit balance is insufficient. Purchase credits at /v1/billing/credits.",
            })),
        )
            .into_response();
    };

    // Best-effort, decoupled from this request: usage is logged locally and
    // the provider can be reconciled later.
    if let Some(meter) = &state.meter {
        let meter = meter.clone();
        let account_id = account.id;
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = meter
                .report_usage(account_id, &customer_id, &endpoint, price)
                .await
            {
                tracing::error!(account_id = %account_id, error = %e, "failed to report metered usage");
            }
        });
    }

    log_usage(state, &account.id, &request_id, &endpoint, &method, price, "metered").await;
    next.run(req).await
}

async fn log_usage(
    state: &AppState,
    account_id: &uuid::Uuid,
    request_id: &str,
    endpoint: &str,
    method: &str,
    price: MicroUsdc,
    payment_method: &str,
) {
    let log = UsageLog::for_request(*account_id, request_id, endpoint, method, price, payment_method);
    if let Err(e) = state.db.create_usage_log(&log).await {
        tracing::error!(account_id = %account_id, error = %e, "failed to create usage log");
    }
}

/// The 402 response listing one payment option per configured network.
pub fn payment_required_response(state: &AppState, price: MicroUsdc) -> Response {
    let accepts: Vec<PaymentRequirements> = state
        .config
        .networks
        .iter()
        .filter_map(|network| {
            let recipient = state.config.wallet_for_network(network)?;
            Some(PaymentRequirements {
                scheme: "x402".to_string(),
                network: network.clone(),
                recipient: recipient.to_string(),
                amount: price.to_chain_units(network).to_string(),
                currency: "USDC".to_string(),
                facilitator_url: state.config.facilitator_url.clone(),
                description: "Stronghold security scan".to_string(),
                fee_payer: if is_solana_network(network) {
                    state.config.solana_fee_payer.clone()
                } else {
                    None
                },
            })
        })
        .collect();

    (
        StatusCode::PAYMENT_REQUIRED,
        Json(serde_json::json!({
            "error": "Payment required",
            "accepts": accepts,
        })),
    )
        .into_response()
}
