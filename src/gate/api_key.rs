//! API-key authentication for B2B accounts.

use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::store::api_keys::{hash_key, API_KEY_PREFIX};
use crate::store::{Account, AccountStatus, AccountType, ApiKey, Db};

/// The account and key ids bound into the request after authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub account_id: Uuid,
    pub api_key_id: Uuid,
}

/// Whether an Authorization header value looks like one of our API keys
/// (as opposed to a session JWT or anything else).
pub fn looks_like_api_key(auth_header: &str) -> bool {
    let token = auth_header.strip_prefix("Bearer ").unwrap_or(auth_header);
    token.starts_with(API_KEY_PREFIX)
}

/// Validate the bearer key and load the owning account.
///
/// The key must hash to a non-revoked row, and the account must be an
/// active B2B account. On success the key's `last_used_at` is refreshed in
/// the background, decoupled from this request's lifetime.
pub async fn authenticate(db: &Db, headers: &HeaderMap) -> Result<(Account, ApiKey), GatewayError> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Unauthorized("Missing authorization header".into()))?;

    let token = match auth_header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token,
        _ => return Err(GatewayError::Unauthorized("Invalid authorization header".into())),
    };

    if !token.starts_with(API_KEY_PREFIX) {
        return Err(GatewayError::Unauthorized("Invalid API key format".into()));
    }

    let key = db
        .get_api_key_by_hash(&hash_key(token))
        .await?
        .ok_or_else(|| GatewayError::Unauthorized("Invalid API key".into()))?;

    let account = db
        .get_account_by_id(key.account_id)
        .await?
        .ok_or_else(|| GatewayError::Unauthorized("Account not found".into()))?;

    if account.account_type != AccountType::B2b {
        return Err(GatewayError::Forbidden(
            "API keys require a business account".into(),
        ));
    }
    if account.status != AccountStatus::Active {
        return Err(GatewayError::Forbidden("Account is not active".into()));
    }

    // Fire-and-forget; the row update must survive the request ending.
    let db = db.clone();
    let key_id = key.id;
    tokio::spawn(async move {
        if let Err(e) = db.update_api_key_last_used(key_id).await {
            tracing::debug!(error = %e, "failed to update API key last_used_at");
        }
    });

    Ok((account, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_api_key() {
        assert!(looks_like_api_key("Bearer sk_live_abc123"));
        assert!(looks_like_api_key("sk_live_abc123"));
        assert!(!looks_like_api_key("Bearer eyJhbGciOiJIUzI1NiJ9.x.y"));
        assert!(!looks_like_api_key(""));
    }
}
