//! Webhook idempotency guard and deposit completion.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::store::Db;
use crate::usdc::MicroUsdc;

#[derive(Debug, Clone)]
pub struct Deposit {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: MicroUsdc,
    /// "pending" or "completed".
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn deposit_from_row(row: &PgRow) -> Deposit {
    Deposit {
        id: row.get("id"),
        account_id: row.get("account_id"),
        amount: MicroUsdc(row.get::<i64, _>("amount_usdc")),
        status: row.get("status"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    }
}

impl Db {
    /// CHECK-AND-RECORD: record the event id, returning whether this call
    /// inserted it. `false` means a duplicate delivery; the caller answers
    /// 200 without re-applying the side effect.
    pub async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO processed_webhook_events (event_id, event_type, processed_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drop processed events older than the retention window.
    pub async fn cleanup_old_webhook_events(
        &self,
        retention_days: i64,
    ) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn create_deposit(
        &self,
        account_id: Uuid,
        amount: MicroUsdc,
    ) -> Result<Deposit, sqlx::Error> {
        let row = sqlx::query(
            "INSERT INTO deposits (id, account_id, amount_usdc, status, created_at)
             VALUES ($1, $2, $3, 'pending', $4)
             RETURNING id, account_id, amount_usdc, status, created_at, completed_at",
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(amount.raw())
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;

        Ok(deposit_from_row(&row))
    }

    /// Mark a pending deposit completed and credit the account, atomically.
    /// Idempotent: a second call finds no pending row and changes nothing.
    pub async fn complete_deposit(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "UPDATE deposits SET status = 'completed', completed_at = $2
             WHERE id = $1 AND status = 'pending'
             RETURNING account_id, amount_usdc",
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let account_id: Uuid = row.get("account_id");
        let amount: i64 = row.get("amount_usdc");

        sqlx::query("UPDATE accounts SET balance_usdc = balance_usdc + $2 WHERE id = $1")
            .bind(account_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}
