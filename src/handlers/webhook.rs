//! Billing-provider webhook.
//!
//! Every event passes three gates before its side effect is applied:
//! signature over the raw body, a five-minute replay window, and the
//! processed-event idempotency guard. Duplicate deliveries return 200
//! without re-applying anything.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::handlers::AppState;

const SIGNATURE_HEADER: &str = "Stronghold-Billing-Signature";
/// Events older than this are rejected as replays.
const REPLAY_WINDOW_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    /// Unix seconds at which the provider created the event.
    created: i64,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OnrampSession {
    id: String,
    status: String,
    #[serde(default)]
    metadata: OnrampMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct OnrampMetadata {
    #[serde(default)]
    deposit_id: String,
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        tracing::warn!("billing webhook missing signature header");
        return bad_request("Missing signature header");
    };

    if !verify_signature(&state.config.webhook_secret, signature, &body) {
        tracing::warn!("billing webhook signature verification failed");
        return bad_request("Invalid signature");
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable webhook body");
            return bad_request("Invalid event payload");
        }
    };

    let age = chrono::Utc::now().timestamp() - event.created;
    if age > REPLAY_WINDOW_SECS {
        tracing::warn!(event_id = %event.id, age_secs = age, "webhook event outside replay window");
        return bad_request("Event is too old");
    }

    tracing::info!(event_id = %event.id, event_type = %event.event_type, "billing webhook received");

    // Idempotency guard: exactly one delivery applies the side effect.
    match state.db.record_webhook_event(&event.id, &event.event_type).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(event_id = %event.id, "duplicate webhook delivery, skipping");
            return ok(serde_json::json!({ "received": true, "status": "duplicate" }));
        }
        Err(e) => {
            tracing::error!(event_id = %event.id, error = %e, "failed to record webhook event");
            return server_error();
        }
    }

    match event.event_type.as_str() {
        "crypto.onramp_session.updated" => handle_onramp_updated(&state, event.data.object).await,
        other => {
            // Unhandled events still return 200 so the provider stops
            // retrying them.
            tracing::debug!(event_type = other, "unhandled webhook event type");
            ok(serde_json::json!({ "received": true }))
        }
    }
}

async fn handle_onramp_updated(
    state: &AppState,
    object: serde_json::Value,
) -> (StatusCode, Json<serde_json::Value>) {
    let session: OnrampSession = match serde_json::from_value(object) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to parse onramp session data");
            return bad_request("Invalid event data");
        }
    };

    if session.metadata.deposit_id.is_empty() {
        // Not a session we created; acknowledge and move on.
        tracing::warn!(session_id = %session.id, "onramp session missing deposit_id metadata");
        return ok(serde_json::json!({
            "received": true,
            "warning": "missing deposit_id in metadata",
        }));
    }

    let deposit_id = match Uuid::parse_str(&session.metadata.deposit_id) {
        Ok(id) => id,
        Err(_) => {
            tracing::error!(deposit_id = %session.metadata.deposit_id, "invalid deposit_id in metadata");
            return bad_request("Invalid deposit_id format");
        }
    };

    match session.status.as_str() {
        "fulfillment_complete" => match state.db.complete_deposit(deposit_id).await {
            Ok(true) => {
                tracing::info!(deposit_id = %deposit_id, "deposit completed and credited");
                ok(serde_json::json!({ "received": true, "status": "completed" }))
            }
            Ok(false) => {
                tracing::info!(deposit_id = %deposit_id, "deposit already completed");
                ok(serde_json::json!({ "received": true, "status": "already_completed" }))
            }
            Err(e) => {
                tracing::error!(deposit_id = %deposit_id, error = %e, "failed to complete deposit");
                server_error()
            }
        },
        other => {
            tracing::debug!(deposit_id = %deposit_id, status = other, "onramp session not complete yet");
            ok(serde_json::json!({ "received": true }))
        }
    }
}

/// Verify `t=<unix>,v1=<hex>` where v1 = HMAC-SHA256(secret, "<t>.<body>").
fn verify_signature(secret: &str, header: &str, body: &[u8]) -> bool {
    if secret.is_empty() {
        return false;
    }

    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => signature = Some(v),
            _ => {}
        }
    }
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return false;
    };
    let Ok(provided) = hex::decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

fn ok(body: serde_json::Value) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(body))
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

fn server_error() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "Internal error" })),
    )
}

/// Build a valid signature header for a body. Used by tests and the
/// provider-simulation tooling.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
