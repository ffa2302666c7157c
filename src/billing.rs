//! Metered-usage reporting to the billing provider.
//!
//! Reporting is best-effort: the local usage log is the durable record, and
//! the provider can be reconciled against it later. A failed tick never
//! fails the customer's request.

use std::time::Duration;
use uuid::Uuid;

use crate::usdc::MicroUsdc;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);
const METER_EVENT_NAME: &str = "stronghold_scan";

/// Client that pushes metered usage ticks to the billing provider.
#[derive(Debug)]
pub struct MeterReporter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl MeterReporter {
    /// `endpoint` is the provider's meter-event API; empty disables the
    /// reporter (callers hold an `Option<MeterReporter>`).
    pub fn new(endpoint: &str, api_key: &str) -> Option<Self> {
        if endpoint.is_empty() {
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Report one billable call against the customer's meter.
    pub async fn report_usage(
        &self,
        account_id: Uuid,
        customer_id: &str,
        endpoint: &str,
        amount: MicroUsdc,
    ) -> Result<(), reqwest::Error> {
        let body = serde_json::json!({
            "event_name": METER_EVENT_NAME,
            "payload": {
                "stripe_customer_id": customer_id,
                "value": amount.raw().to_string(),
                "endpoint": endpoint,
                "account_id": account_id.to_string(),
            },
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(
            account_id = %account_id,
            status = %resp.status(),
            "metered usage reported"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_endpoint_disables_reporter() {
        assert!(MeterReporter::new("", "sk_test").is_none());
        assert!(MeterReporter::new("https://billing.example/meters", "sk_test").is_some());
    }
}
