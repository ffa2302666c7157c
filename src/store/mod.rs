//! Persistence layer.
//!
//! The PaymentTransaction row *is* the payment state machine: every
//! transition is a conditional `UPDATE ... WHERE status = <expected>`, so
//! concurrent processes serialize through the store and a crash mid-settle
//! leaves a row the settlement worker can pick back up.

pub mod accounts;
pub mod api_keys;
pub mod payments;
pub mod usage;
pub mod webhooks;

use sqlx::postgres::{PgPool, PgPoolOptions};

pub use accounts::{Account, AccountStatus, AccountType};
pub use api_keys::ApiKey;
pub use payments::{NewPaymentTransaction, PaymentStatus, PaymentTransaction};
pub use usage::UsageLog;

/// Thin wrapper around the Postgres pool, injected into every subsystem
/// that persists state.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

/// Whether a database error is a unique-constraint violation. The payment
/// nonce's uniqueness is the idempotency anchor; callers translate this
/// into a 409 rather than a 500.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}
