//! API key entity and operations.
//!
//! Only the SHA-256 hash of a key is stored; the raw secret is shown to the
//! creator once and never again. The prefix is display-only.

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::store::Db;

/// Every live key starts with this prefix; the payment router uses it to
/// distinguish API keys from other bearer tokens.
pub const API_KEY_PREFIX: &str = "sk_live_";

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub account_id: Uuid,
    pub key_prefix: String,
    pub key_hash: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

fn api_key_from_row(row: &PgRow) -> ApiKey {
    ApiKey {
        id: row.get("id"),
        account_id: row.get("account_id"),
        key_prefix: row.get("key_prefix"),
        key_hash: row.get("key_hash"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        last_used_at: row.get("last_used_at"),
        revoked_at: row.get("revoked_at"),
    }
}

const API_KEY_COLUMNS: &str =
    "id, account_id, key_prefix, key_hash, name, created_at, last_used_at, revoked_at";

/// Generate a new raw key with its display prefix and storage hash.
pub fn generate_key() -> (String, String, String) {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    let raw = format!("{API_KEY_PREFIX}{}", hex::encode(secret));
    let prefix = raw[..API_KEY_PREFIX.len() + 8].to_string();
    (raw.clone(), prefix, hash_key(&raw))
}

/// SHA-256 hex digest of a full key, the lookup index.
pub fn hash_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

impl Db {
    pub async fn create_api_key(
        &self,
        account_id: Uuid,
        key_prefix: &str,
        key_hash: &str,
        name: &str,
    ) -> Result<ApiKey, sqlx::Error> {
        let row = sqlx::query(&format!(
            "INSERT INTO api_keys (id, account_id, key_prefix, key_hash, name, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {API_KEY_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(key_prefix)
        .bind(key_hash)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;

        Ok(api_key_from_row(&row))
    }

    /// Look up a key by hash. Revoked keys never match.
    pub async fn get_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKey>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys
             WHERE key_hash = $1 AND revoked_at IS NULL"
        ))
        .bind(key_hash)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(api_key_from_row))
    }

    pub async fn list_api_keys(&self, account_id: Uuid) -> Result<Vec<ApiKey>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys
             WHERE account_id = $1 AND revoked_at IS NULL
             ORDER BY created_at DESC"
        ))
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(api_key_from_row).collect())
    }

    /// Revoke a key, verifying ownership. Returns false when the key does
    /// not exist, belongs to someone else, or is already revoked.
    pub async fn revoke_api_key(
        &self,
        key_id: Uuid,
        account_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = $1
             WHERE id = $2 AND account_id = $3 AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(key_id)
        .bind(account_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn update_api_key_last_used(&self, key_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE api_keys SET last_used_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(key_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_shape() {
        let (raw, prefix, hash) = generate_key();
        assert!(raw.starts_with(API_KEY_PREFIX));
        assert_eq!(raw.len(), API_KEY_PREFIX.len() + 64);
        assert_eq!(prefix.len(), API_KEY_PREFIX.len() + 8);
        assert!(raw.starts_with(&prefix));
        assert_eq!(hash.len(), 64);
        // The prefix must not reveal the full secret
        assert_ne!(prefix, raw);
    }

    #[test]
    fn test_hash_is_deterministic_and_distinct() {
        let (raw1, _, hash1) = generate_key();
        let (raw2, _, hash2) = generate_key();
        assert_eq!(hash_key(&raw1), hash1);
        assert_ne!(raw1, raw2);
        assert_ne!(hash1, hash2);
    }
}
