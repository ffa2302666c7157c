//! The atomic x402 payment middleware: reserve → execute → settle.
//!
//! The PaymentTransaction row is the state machine; this middleware drives
//! it around one request. The guarantees, in order of importance:
//!
//! - a nonce never executes the handler twice (replays serve the cached
//!   result, concurrent attempts get 409);
//! - a served 2xx is always followed by either a settlement or a durable
//!   retry record, so the caller never owes money for an unserved request;
//! - a handler error is never settled.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::GatewayError;
use crate::facilitator::FacilitatorError;
use crate::handlers::AppState;
use crate::payments::{
    self, envelope::PaymentPayload, is_solana_network, parse_payment_header, PaymentError,
};
use crate::store::{NewPaymentTransaction, PaymentStatus};
use crate::usdc::MicroUsdc;

/// Handler responses are buffered for the service-result cache; anything
/// bigger than this is a bug in a scan handler.
const MAX_RESULT_BYTES: usize = 4 * 1024 * 1024;

pub async fn atomic_payment(
    state: &AppState,
    price: MicroUsdc,
    payment_header: &str,
    req: Request,
    next: Next,
) -> Response {
    let endpoint = req.uri().path().to_string();

    // Parse and locally verify before touching the store or the network.
    let payload = match parse_payment_header(payment_header) {
        Ok(p) => p,
        Err(e) => {
            tracing::info!(error = %e, "unparseable payment header");
            let msg = match e {
                PaymentError::InvalidFormat(msg) => msg,
                other => other.to_string(),
            };
            return GatewayError::InvalidFormat(msg).into_response();
        }
    };

    if let Err(e) = verify_locally(state, price, &payload) {
        tracing::info!(nonce = %payload.nonce, error = %e, "payment failed local verification");
        return e.into_response();
    }

    // Idempotency: the nonce decides whether this envelope has been here
    // before.
    match state.db.get_payment_by_nonce(&payload.nonce).await {
        Ok(Some(existing)) => {
            if let Some(result) = existing.service_result {
                tracing::debug!(nonce = %payload.nonce, "replaying cached service result");
                return replay_response(&result);
            }
            return match existing.status {
                PaymentStatus::Reserved | PaymentStatus::Executing => {
                    GatewayError::LockConflict.into_response()
                }
                _ => GatewayError::PaymentRejected(
                    "payment nonce was already used and did not complete".into(),
                )
                .into_response(),
            };
        }
        Ok(None) => {}
        Err(e) => return GatewayError::from(e).into_response(),
    }

    // Reserve. A unique violation means we raced another request carrying
    // the same nonce; whichever INSERTed first wins.
    let reservation = NewPaymentTransaction {
        payment_nonce: payload.nonce.clone(),
        payment_header: payment_header.to_string(),
        payer_address: payload.payer.clone(),
        receiver_address: payload.receiver.clone(),
        endpoint: endpoint.clone(),
        amount: price,
        network: payload.network.clone(),
        chain: payload.network.clone(),
    };
    let payment = match state.db.create_reservation(&reservation).await {
        Ok(p) => p,
        Err(e) if crate::store::is_unique_violation(&e) => {
            return GatewayError::LockConflict.into_response()
        }
        Err(e) => return GatewayError::from(e).into_response(),
    };

    // The facilitator is authoritative; a clean local verify can still be a
    // double-spend on chain.
    if let Err(e) = state.facilitator.verify(payment_header, &payload).await {
        let gateway_err = match e {
            FacilitatorError::Rejected(reason) => {
                if let Err(db_err) = state.db.mark_failed(payment.id, &reason).await {
                    tracing::error!(payment_id = %payment.id, error = %db_err, "failed to record rejection");
                }
                GatewayError::PaymentRejected(reason)
            }
            FacilitatorError::Transport(reason) => {
                if let Err(db_err) = state.db.mark_failed(payment.id, &reason).await {
                    tracing::error!(payment_id = %payment.id, error = %db_err, "failed to record verify failure");
                }
                GatewayError::TransientFacilitator(reason)
            }
        };
        return gateway_err.into_response();
    }

    // Execute.
    match state.db.mark_executing(payment.id).await {
        Ok(true) => {}
        Ok(false) => {
            // The expiration sweeper (or another process) moved the row.
            return GatewayError::LockConflict.into_response();
        }
        Err(e) => return GatewayError::from(e).into_response(),
    }

    let response = next.run(req).await;
    let (mut parts, body) = response.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_RESULT_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let msg = format!("handler response unreadable: {e}");
            if let Err(db_err) = state.db.mark_failed(payment.id, &msg).await {
                tracing::error!(payment_id = %payment.id, error = %db_err, "failed to record handler failure");
            }
            return GatewayError::Internal(anyhow::anyhow!(msg)).into_response();
        }
    };

    if !parts.status.is_success() {
        // Service errors are not settled; the customer is not charged for a
        // failed scan. The row is held for postmortem.
        let msg = format!("service returned {}", parts.status.as_u16());
        if let Err(e) = state.db.mark_failed(payment.id, &msg).await {
            tracing::error!(payment_id = %payment.id, error = %e, "failed to record handler error");
        }
        return Response::from_parts(parts, Body::from(body_bytes));
    }

    // Cache the result first: from here on, replays of this nonce must be
    // served without re-execution even if settlement takes days.
    let result_value = service_result_value(&body_bytes);
    if let Err(e) = state.db.record_service_result(payment.id, &result_value).await {
        tracing::error!(payment_id = %payment.id, error = %e, "failed to cache service result");
    }

    // Settle. Deliberately outside any DB transaction: no row lock is held
    // across the facilitator round-trip.
    match state.db.mark_settling(payment.id).await {
        Ok(true) => match state.facilitator.settle(payment_header, &payload).await {
            Ok(settlement) => {
                match state
                    .db
                    .complete_settlement(payment.id, &settlement.payment_id)
                    .await
                {
                    Ok(_) => {
                        crate::observability::metrics::record_settlement("success");
                        tracing::info!(
                            payment_id = %payment.id,
                            facilitator_payment_id = %settlement.payment_id,
                            "payment settled"
                        );
                        let header = serde_json::json!({
                            "payment_id": settlement.payment_id,
                            "status": "settled",
                        });
                        if let Ok(value) = HeaderValue::from_str(&header.to_string()) {
                            parts.headers.insert("X-Payment-Response", value);
                        }
                    }
                    Err(e) => {
                        tracing::error!(payment_id = %payment.id, error = %e, "failed to record completion");
                    }
                }
            }
            Err(e) => {
                // The customer has been served; settlement is retried in
                // the background.
                tracing::warn!(payment_id = %payment.id, error = %e, "settlement failed, queued for retry");
                if let Err(db_err) = state.db.fail_settlement(payment.id, &e.to_string()).await {
                    tracing::error!(payment_id = %payment.id, error = %db_err, "failed to record settlement failure");
                }
            }
        },
        Ok(false) => {
            tracing::error!(payment_id = %payment.id, "payment left executing state unexpectedly");
        }
        Err(e) => {
            tracing::error!(payment_id = %payment.id, error = %e, "failed to mark settling");
        }
    }

    Response::from_parts(parts, Body::from(body_bytes))
}

/// Everything that can be checked without the facilitator: amount, receiver,
/// and the cryptographic binding to the declared payer.
fn verify_locally(
    state: &AppState,
    price: MicroUsdc,
    payload: &PaymentPayload,
) -> Result<(), GatewayError> {
    if payload.scheme != "x402" {
        return Err(GatewayError::InvalidFormat(format!(
            "unknown payload scheme {:?}",
            payload.scheme
        )));
    }

    if !state.config.networks.iter().any(|n| n == &payload.network) {
        return Err(GatewayError::PaymentRejected(format!(
            "network {} is not accepted",
            payload.network
        )));
    }

    let expected_receiver = state
        .config
        .wallet_for_network(&payload.network)
        .ok_or_else(|| {
            GatewayError::PaymentRejected(format!(
                "no receiving wallet configured for {}",
                payload.network
            ))
        })?;

    // Hex addresses compare case-insensitively; base58 is case-sensitive.
    let receiver_matches = if is_solana_network(&payload.network) {
        payload.receiver == expected_receiver
    } else {
        payload.receiver.eq_ignore_ascii_case(expected_receiver)
    };
    if !receiver_matches {
        return Err(GatewayError::PaymentRejected(format!(
            "recipient mismatch: expected {expected_receiver}, got {}",
            payload.receiver
        )));
    }

    let expected_amount = price.to_chain_units(&payload.network);
    let amount: i128 = payload
        .amount
        .parse()
        .map_err(|_| GatewayError::InvalidFormat(format!("bad amount {:?}", payload.amount)))?;
    if amount != expected_amount {
        return Err(GatewayError::PaymentRejected(format!(
            "amount mismatch: expected {expected_amount}, got {amount}"
        )));
    }

    let verified = if is_solana_network(&payload.network) {
        payments::solana::verify_partial_signature(payload)
    } else {
        payments::evm::verify_payment_signature(payload)
    };
    verified.map_err(|e| match e {
        PaymentError::Signature(msg) => GatewayError::InvalidFormat(format!("invalid signature: {msg}")),
        other => GatewayError::InvalidFormat(other.to_string()),
    })
}

/// Persisted form of the handler's body. JSON bodies are stored as-is;
/// anything else is wrapped so the replay path can reproduce exact bytes.
fn service_result_value(body: &[u8]) -> serde_json::Value {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => value,
        Err(_) => serde_json::json!({ "raw": String::from_utf8_lossy(body) }),
    }
}

fn replay_response(result: &serde_json::Value) -> Response {
    let mut response = if let Some(raw) = result.get("raw").and_then(|r| r.as_str()) {
        (StatusCode::OK, raw.to_string()).into_response()
    } else {
        (StatusCode::OK, Json(result.clone())).into_response()
    };
    response
        .headers_mut()
        .insert("X-Stronghold-Replay", HeaderValue::from_static("true"));
    response
}
