//! Usage log entries for billed API requests.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::Db;
use crate::usdc::MicroUsdc;

#[derive(Debug, Clone)]
pub struct UsageLog {
    pub id: Uuid,
    pub account_id: Uuid,
    pub request_id: String,
    pub endpoint: String,
    pub method: String,
    pub cost: MicroUsdc,
    /// "success", "threat", or "error".
    pub status: String,
    pub threat_type: Option<String>,
    pub request_size: i64,
    pub response_size: i64,
    pub latency_ms: i64,
    pub metadata: serde_json::Value,
    pub payment_transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl UsageLog {
    /// A minimal success-row for a gated API call.
    pub fn for_request(
        account_id: Uuid,
        request_id: &str,
        endpoint: &str,
        method: &str,
        cost: MicroUsdc,
        payment_method: &str,
    ) -> Self {
        UsageLog {
            id: Uuid::new_v4(),
            account_id,
            request_id: request_id.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            cost,
            status: "success".to_string(),
            threat_type: None,
            request_size: 0,
            response_size: 0,
            latency_ms: 0,
            metadata: serde_json::json!({
                "payment_method": payment_method,
                "account_type": "b2b",
            }),
            payment_transaction_id: None,
            created_at: Utc::now(),
        }
    }
}

impl Db {
    pub async fn create_usage_log(&self, log: &UsageLog) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO usage_logs
                 (id, account_id, request_id, endpoint, method, cost_usdc, status,
                  threat_type, request_size, response_size, latency_ms, metadata,
                  payment_transaction_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(log.id)
        .bind(log.account_id)
        .bind(&log.request_id)
        .bind(&log.endpoint)
        .bind(&log.method)
        .bind(log.cost.raw())
        .bind(&log.status)
        .bind(&log.threat_type)
        .bind(log.request_size)
        .bind(log.response_size)
        .bind(log.latency_ms)
        .bind(&log.metadata)
        .bind(log.payment_transaction_id)
        .bind(log.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_request_metadata() {
        let log = UsageLog::for_request(
            Uuid::new_v4(),
            "req-1",
            "/v1/scan/content",
            "POST",
            MicroUsdc(1_000),
            "credits",
        );
        assert_eq!(log.status, "success");
        assert_eq!(log.metadata["payment_method"], "credits");
        assert_eq!(log.cost, MicroUsdc(1_000));
    }
}
