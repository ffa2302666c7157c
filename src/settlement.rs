//! Background settlement worker.
//!
//! Two cooperating loops under the shared shutdown signal: one retries
//! failed settlements with bounded exponential backoff, one expires stale
//! reservations. The caller was already served; these loops make sure the
//! money side converges.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::facilitator::FacilitatorClient;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::payments::parse_payment_header;
use crate::store::{Db, PaymentTransaction};

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to check for failed settlements.
    pub retry_interval: Duration,
    /// Give up (hold the row for manual review) after this many attempts.
    pub max_retry_attempts: i32,
    /// Maximum payments processed per retry cycle.
    pub batch_size: i64,
    /// How often to check for expired reservations.
    pub expiration_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(30),
            max_retry_attempts: 5,
            batch_size: 100,
            expiration_check_interval: Duration::from_secs(60),
        }
    }
}

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);
const WEBHOOK_RETENTION_DAYS: i64 = 30;

/// Retries failed settlements and expires stale reservations.
pub struct SettlementWorker {
    db: Db,
    facilitator: FacilitatorClient,
    config: WorkerConfig,
}

impl SettlementWorker {
    pub fn new(db: Db, facilitator: FacilitatorClient, config: WorkerConfig) -> Self {
        Self {
            db,
            facilitator,
            config,
        }
    }

    /// Run both loops until shutdown. Each loop finishes its current batch
    /// before exiting.
    pub async fn run(self: Arc<Self>, shutdown: &Shutdown) {
        tracing::info!("settlement worker started");

        // Housekeeping piggybacked on worker startup: processed webhook
        // events past the retention window can go.
        match self.db.cleanup_old_webhook_events(WEBHOOK_RETENTION_DAYS).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "cleaned up old webhook events"),
            Err(e) => tracing::error!(error = %e, "webhook event cleanup failed"),
        }

        let retry = self.clone().run_retry_loop(shutdown.subscribe());
        let expire = self.clone().run_expiration_loop(shutdown.subscribe());
        tokio::join!(retry, expire);
        tracing::info!("settlement worker stopped");
    }

    async fn run_retry_loop(self: Arc<Self>, mut stop: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.retry_failed_settlements().await,
                _ = stop.recv() => return,
            }
        }
    }

    async fn run_expiration_loop(self: Arc<Self>, mut stop: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.expiration_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.expire_stale_reservations().await,
                _ = stop.recv() => return,
            }
        }
    }

    async fn retry_failed_settlements(&self) {
        let payments = match self
            .db
            .get_pending_settlements(self.config.max_retry_attempts, self.config.batch_size)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to get pending settlements");
                return;
            }
        };

        if payments.is_empty() {
            return;
        }
        tracing::info!(count = payments.len(), "retrying failed settlements");

        for payment in payments {
            if !self.due_for_retry(&payment) {
                continue;
            }
            self.retry_one(payment).await;
        }
    }

    /// A payment is due once its backoff window since execution has passed.
    fn due_for_retry(&self, payment: &PaymentTransaction) -> bool {
        let Some(executed_at) = payment.executed_at else {
            return false;
        };
        let elapsed = (chrono::Utc::now() - executed_at)
            .to_std()
            .unwrap_or_default();
        elapsed >= backoff_with_jitter(payment.settlement_attempts)
    }

    async fn retry_one(&self, payment: PaymentTransaction) {
        let payload = match parse_payment_header(&payment.payment_header) {
            Ok(p) => p,
            Err(e) => {
                // A header that no longer parses will never settle; push it
                // past the retry ceiling for manual review.
                tracing::error!(payment_id = %payment.id, error = %e, "stored payment header unparseable");
                let _ = self
                    .db
                    .fail_settlement(payment.id, &format!("unparseable header: {e}"))
                    .await;
                return;
            }
        };

        match self.db.mark_settling(payment.id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::error!(payment_id = %payment.id, error = %e, "failed to mark settling");
                return;
            }
        }

        match self
            .facilitator
            .settle(&payment.payment_header, &payload)
            .await
        {
            Ok(settlement) => {
                match self
                    .db
                    .complete_settlement(payment.id, &settlement.payment_id)
                    .await
                {
                    Ok(_) => {
                        metrics::record_settlement("retry_success");
                        tracing::info!(
                            payment_id = %payment.id,
                            attempt = payment.settlement_attempts + 1,
                            "settlement succeeded on retry"
                        );
                    }
                    Err(e) => {
                        tracing::error!(payment_id = %payment.id, error = %e, "failed to record completion");
                    }
                }
            }
            Err(e) => {
                metrics::record_settlement("retry_failure");
                tracing::error!(
                    payment_id = %payment.id,
                    attempt = payment.settlement_attempts + 1,
                    error = %e,
                    "settlement retry failed"
                );
                if let Err(db_err) = self.db.fail_settlement(payment.id, &e.to_string()).await {
                    tracing::error!(payment_id = %payment.id, error = %db_err, "failed to record settlement failure");
                }
            }
        }
    }

    async fn expire_stale_reservations(&self) {
        match self.db.expire_stale_reservations().await {
            Ok(0) => {}
            Ok(count) => {
                tracing::info!(count, "expired stale payment reservations");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to expire stale reservations");
            }
        }
    }
}

/// `min(base × 2^attempts, max)`: 5s, 10s, 20s, 40s, 80s, … capped at 5m.
pub fn backoff_delay(attempts: i32) -> Duration {
    let factor = 2u64.saturating_pow(attempts.max(0) as u32);
    BACKOFF_BASE.saturating_mul(factor as u32).min(BACKOFF_MAX)
}

/// Backoff plus up to 50% random jitter, so a burst of failures does not
/// retry in lockstep.
fn backoff_with_jitter(attempts: i32) -> Duration {
    let base = backoff_delay(attempts);
    let jitter_max = base.as_millis() as u64 / 2;
    let jitter = if jitter_max > 0 {
        rand::thread_rng().gen_range(0..jitter_max)
    } else {
        0
    };
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert_eq!(backoff_delay(3), Duration::from_secs(40));
        assert_eq!(backoff_delay(4), Duration::from_secs(80));
        // Capped at five minutes
        assert_eq!(backoff_delay(10), Duration::from_secs(300));
        assert_eq!(backoff_delay(100), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        for attempts in 0..6 {
            let base = backoff_delay(attempts);
            for _ in 0..20 {
                let jittered = backoff_with_jitter(attempts);
                assert!(jittered >= base);
                assert!(jittered <= base + base / 2);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.expiration_check_interval, Duration::from_secs(60));
    }
}
