//! Account entity and balance operations.

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::store::Db;
use crate::usdc::MicroUsdc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Closed => "closed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "suspended" => AccountStatus::Suspended,
            "closed" => AccountStatus::Closed,
            _ => AccountStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    B2c,
    B2b,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::B2c => "b2c",
            AccountType::B2b => "b2b",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "b2b" => AccountType::B2b,
            _ => AccountType::B2c,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub account_number: String,
    pub email: Option<String>,
    pub company_name: Option<String>,
    pub evm_wallet_address: Option<String>,
    pub solana_wallet_address: Option<String>,
    pub status: AccountStatus,
    pub account_type: AccountType,
    pub stripe_customer_id: Option<String>,
    pub balance: MicroUsdc,
    pub created_at: DateTime<Utc>,
}

fn account_from_row(row: &PgRow) -> Account {
    Account {
        id: row.get("id"),
        account_number: row.get("account_number"),
        email: row.get("email"),
        company_name: row.get("company_name"),
        evm_wallet_address: row.get("evm_wallet_address"),
        solana_wallet_address: row.get("solana_wallet_address"),
        status: AccountStatus::from_str(row.get::<String, _>("status").as_str()),
        account_type: AccountType::from_str(row.get::<String, _>("account_type").as_str()),
        stripe_customer_id: row.get("stripe_customer_id"),
        balance: MicroUsdc(row.get::<i64, _>("balance_usdc")),
        created_at: row.get("created_at"),
    }
}

const ACCOUNT_COLUMNS: &str = "id, account_number, email, company_name, evm_wallet_address, \
     solana_wallet_address, status, account_type, stripe_customer_id, balance_usdc, created_at";

/// Generate an opaque account number: four dash-separated 4-digit groups.
pub fn generate_account_number() -> String {
    let mut rng = rand::thread_rng();
    (0..4)
        .map(|_| format!("{:04}", rng.gen_range(0..10_000)))
        .collect::<Vec<_>>()
        .join("-")
}

impl Db {
    pub async fn create_account(
        &self,
        email: Option<&str>,
        company_name: Option<&str>,
        account_type: AccountType,
    ) -> Result<Account, sqlx::Error> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (id, account_number, email, company_name, status, account_type, balance_usdc, created_at)
             VALUES ($1, $2, $3, $4, 'active', $5, 0, $6)
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(generate_account_number())
        .bind(email)
        .bind(company_name)
        .bind(account_type.as_str())
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;

        Ok(account_from_row(&row))
    }

    pub async fn get_account_by_id(&self, id: Uuid) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(account_from_row))
    }

    /// Atomically deduct `amount` from the account's balance. The single
    /// conditional UPDATE is the sole source of truth for credit spending:
    /// at most one of N concurrent requests wins the last balance.
    pub async fn deduct_balance(
        &self,
        account_id: Uuid,
        amount: MicroUsdc,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE accounts SET balance_usdc = balance_usdc - $2
             WHERE id = $1 AND balance_usdc >= $2",
        )
        .bind(account_id)
        .bind(amount.raw())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Credit a deposit to the account.
    pub async fn credit_balance(
        &self,
        account_id: Uuid,
        amount: MicroUsdc,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET balance_usdc = balance_usdc + $2 WHERE id = $1")
            .bind(account_id)
            .bind(amount.raw())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_stripe_customer(
        &self,
        account_id: Uuid,
        customer_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET stripe_customer_id = $2 WHERE id = $1")
            .bind(account_id)
            .bind(customer_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_number_format() {
        for _ in 0..20 {
            let number = generate_account_number();
            assert_eq!(number.len(), 19);
            let groups: Vec<&str> = number.split('-').collect();
            assert_eq!(groups.len(), 4);
            for group in groups {
                assert_eq!(group.len(), 4);
                assert!(group.chars().all(|c| c.is_ascii_digit()));
            }
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Suspended,
            AccountStatus::Closed,
        ] {
            assert_eq!(AccountStatus::from_str(status.as_str()), status);
        }
        assert_eq!(AccountType::from_str("b2b"), AccountType::B2b);
        assert_eq!(AccountType::from_str("b2c"), AccountType::B2c);
    }
}
