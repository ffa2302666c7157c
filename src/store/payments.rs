//! PaymentTransaction entity: the payment lifecycle state machine.
//!
//! ```text
//!  reserved ──► executing ──► settling ──► completed
//!      │             │           │
//!      ▼             ▼           ▼
//!  expired        failed ◄───────┘   (worker retries failed → settling)
//! ```
//!
//! Transitions are conditional UPDATEs; a transition whose `WHERE status`
//! clause misses affects zero rows and reports false, never corrupts.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::store::Db;
use crate::usdc::MicroUsdc;

/// How long a reservation may sit before the expiration sweeper voids it.
pub const RESERVATION_TTL: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Reserved,
    Executing,
    Settling,
    Completed,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Reserved => "reserved",
            PaymentStatus::Executing => "executing",
            PaymentStatus::Settling => "settling",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "reserved" => PaymentStatus::Reserved,
            "executing" => PaymentStatus::Executing,
            "settling" => PaymentStatus::Settling,
            "completed" => PaymentStatus::Completed,
            "expired" => PaymentStatus::Expired,
            _ => PaymentStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentTransaction {
    pub id: Uuid,
    /// Unique 32-byte random hex; the idempotency anchor.
    pub payment_nonce: String,
    /// The original `X-Payment` header, verbatim, for settlement retries.
    pub payment_header: String,
    pub payer_address: String,
    pub receiver_address: String,
    pub endpoint: String,
    pub amount: MicroUsdc,
    pub network: String,
    pub chain: String,
    pub status: PaymentStatus,
    pub facilitator_payment_id: Option<String>,
    pub settlement_attempts: i32,
    pub last_error: Option<String>,
    /// The handler's response body, cached so replays never re-execute.
    pub service_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// Fields needed to reserve a payment.
#[derive(Debug, Clone)]
pub struct NewPaymentTransaction {
    pub payment_nonce: String,
    pub payment_header: String,
    pub payer_address: String,
    pub receiver_address: String,
    pub endpoint: String,
    pub amount: MicroUsdc,
    pub network: String,
    pub chain: String,
}

fn payment_from_row(row: &PgRow) -> PaymentTransaction {
    PaymentTransaction {
        id: row.get("id"),
        payment_nonce: row.get("payment_nonce"),
        payment_header: row.get("payment_header"),
        payer_address: row.get("payer_address"),
        receiver_address: row.get("receiver_address"),
        endpoint: row.get("endpoint"),
        amount: MicroUsdc(row.get::<i64, _>("amount_usdc")),
        network: row.get("network"),
        chain: row.get("chain"),
        status: PaymentStatus::from_str(row.get::<String, _>("status").as_str()),
        facilitator_payment_id: row.get("facilitator_payment_id"),
        settlement_attempts: row.get("settlement_attempts"),
        last_error: row.get("last_error"),
        service_result: row.get("service_result"),
        created_at: row.get("created_at"),
        executed_at: row.get("executed_at"),
        settled_at: row.get("settled_at"),
        expires_at: row.get("expires_at"),
    }
}

const PAYMENT_COLUMNS: &str = "id, payment_nonce, payment_header, payer_address, receiver_address, \
     endpoint, amount_usdc, network, chain, status, facilitator_payment_id, settlement_attempts, \
     last_error, service_result, created_at, executed_at, settled_at, expires_at";

impl Db {
    /// Insert a new `reserved` row. A unique violation on the nonce means a
    /// concurrent request holds the same envelope.
    pub async fn create_reservation(
        &self,
        new: &NewPaymentTransaction,
    ) -> Result<PaymentTransaction, sqlx::Error> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO payment_transactions
                 (id, payment_nonce, payment_header, payer_address, receiver_address,
                  endpoint, amount_usdc, network, chain, status, settlement_attempts,
                  created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'reserved', 0, $10, $11)
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.payment_nonce)
        .bind(&new.payment_header)
        .bind(&new.payer_address)
        .bind(&new.receiver_address)
        .bind(&new.endpoint)
        .bind(new.amount.raw())
        .bind(&new.network)
        .bind(&new.chain)
        .bind(now)
        .bind(now + RESERVATION_TTL)
        .fetch_one(self.pool())
        .await?;

        Ok(payment_from_row(&row))
    }

    pub async fn get_payment_by_nonce(
        &self,
        nonce: &str,
    ) -> Result<Option<PaymentTransaction>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE payment_nonce = $1"
        ))
        .bind(nonce)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(payment_from_row))
    }

    /// reserved → executing. False when the row is not in `reserved`.
    pub async fn mark_executing(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE payment_transactions
             SET status = 'executing', executed_at = $2
             WHERE id = $1 AND status = 'reserved'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cache the handler's successful response body so replays are served
    /// without re-execution.
    pub async fn record_service_result(
        &self,
        id: Uuid,
        result: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE payment_transactions SET service_result = $2 WHERE id = $1")
            .bind(id)
            .bind(result)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// executing|failed → settling. The worker uses the `failed` arm for
    /// retries; the request path uses the `executing` arm.
    pub async fn mark_settling(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE payment_transactions
             SET status = 'settling'
             WHERE id = $1 AND status IN ('executing', 'failed')",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// settling → completed. Terminal.
    pub async fn complete_settlement(
        &self,
        id: Uuid,
        facilitator_payment_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE payment_transactions
             SET status = 'completed', facilitator_payment_id = $2, settled_at = $3
             WHERE id = $1 AND status = 'settling'",
        )
        .bind(id)
        .bind(facilitator_payment_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// settling → failed, counting the attempt for backoff.
    pub async fn fail_settlement(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE payment_transactions
             SET status = 'failed',
                 settlement_attempts = settlement_attempts + 1,
                 last_error = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(truncate_error(error))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// reserved|executing → failed without counting an attempt: the request
    /// never reached settlement (verify rejected it, or the handler errored),
    /// so the retry worker must not pick it up.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE payment_transactions
             SET status = 'failed', last_error = $2
             WHERE id = $1 AND status IN ('reserved', 'executing')",
        )
        .bind(id)
        .bind(truncate_error(error))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Failed settlements awaiting retry, oldest first. Rows that never
    /// reached settlement (attempts = 0) are excluded: a service error must
    /// not get charged.
    pub async fn get_pending_settlements(
        &self,
        max_attempts: i32,
        batch_size: i64,
    ) -> Result<Vec<PaymentTransaction>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions
             WHERE status = 'failed'
               AND settlement_attempts >= 1
               AND settlement_attempts < $1
             ORDER BY created_at ASC
             LIMIT $2"
        ))
        .bind(max_attempts)
        .bind(batch_size)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(payment_from_row).collect())
    }

    /// Void reservations that sat past their deadline. Returns the count.
    pub async fn expire_stale_reservations(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE payment_transactions
             SET status = 'expired'
             WHERE status = 'reserved' AND expires_at < $1",
        )
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

/// Error digests are for postmortems, not payloads; keep them bounded.
fn truncate_error(error: &str) -> String {
    error.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            PaymentStatus::Reserved,
            PaymentStatus::Executing,
            PaymentStatus::Settling,
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Expired,
        ] {
            assert_eq!(PaymentStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn test_truncate_error() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_error(&long).len(), 500);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn test_reservation_ttl() {
        assert_eq!(RESERVATION_TTL.num_seconds(), 300);
    }
}
