//! API-key management.
//!
//! Gated by the session cookie; creation additionally requires a trusted
//! device. The raw key appears exactly once, in the creation response.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gate::Session;
use crate::handlers::AppState;
use crate::store::api_keys::generate_key;

const MAX_KEYS_PER_ACCOUNT: usize = 10;

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    pub id: Uuid,
    /// The full secret. Shown once, never stored.
    pub key: String,
    pub key_prefix: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub key_prefix: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    session: Session,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<CreateApiKeyResponse>), GatewayError> {
    if !session.device_trusted {
        return Err(GatewayError::Forbidden(
            "Creating API keys requires a trusted device".into(),
        ));
    }

    let name = req.name.trim();
    if name.is_empty() {
        return Err(GatewayError::BadRequest("Key name is required".into()));
    }

    let existing = state.db.list_api_keys(session.account_id).await?;
    if existing.len() >= MAX_KEYS_PER_ACCOUNT {
        return Err(GatewayError::BadRequest(format!(
            "Account already has {MAX_KEYS_PER_ACCOUNT} active keys"
        )));
    }

    let (raw_key, prefix, hash) = generate_key();
    let key = state
        .db
        .create_api_key(session.account_id, &prefix, &hash, name)
        .await?;

    tracing::info!(account_id = %session.account_id, key_id = %key.id, "API key created");

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            id: key.id,
            key: raw_key,
            key_prefix: key.key_prefix,
            name: key.name,
            created_at: key.created_at,
        }),
    ))
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Vec<ApiKeySummary>>, GatewayError> {
    let keys = state.db.list_api_keys(session.account_id).await?;
    Ok(Json(
        keys.into_iter()
            .map(|k| ApiKeySummary {
                id: k.id,
                key_prefix: k.key_prefix,
                name: k.name,
                created_at: k.created_at,
                last_used_at: k.last_used_at,
            })
            .collect(),
    ))
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    session: Session,
    Path(key_id): Path<Uuid>,
) -> Result<StatusCode, GatewayError> {
    let revoked = state.db.revoke_api_key(key_id, session.account_id).await?;
    if !revoked {
        return Err(GatewayError::BadRequest(
            "API key not found or already revoked".into(),
        ));
    }

    tracing::info!(account_id = %session.account_id, key_id = %key_id, "API key revoked");
    Ok(StatusCode::NO_CONTENT)
}
