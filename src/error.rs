//! Gateway error taxonomy.
//!
//! Error kinds carry policy (HTTP status, retryability), not identities.
//! Stack details never cross the network boundary: the JSON body holds only
//! the kind's message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced by the payment gates and handlers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed payment header, JSON, or signature. Never retried.
    #[error("invalid payment format: {0}")]
    InvalidFormat(String),

    /// Facilitator deterministically rejected the payment.
    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    /// Facilitator transport failure; retriable by the settlement worker.
    #[error("facilitator unavailable: {0}")]
    TransientFacilitator(String),

    /// Atomic deduction found no balance and the account has no billing customer.
    #[error("insufficient credits")]
    InsufficientCredit,

    /// A concurrent request holds the same payment nonce.
    #[error("payment is already being processed")]
    LockConflict,

    /// Caller is not authenticated.
    #[error("{0}")]
    Unauthorized(String),

    /// Caller is authenticated but not permitted.
    #[error("{0}")]
    Forbidden(String),

    /// Malformed request body.
    #[error("{0}")]
    BadRequest(String),

    /// Anything unexpected. Logged with the request id; generic to callers.
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidFormat(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::PaymentRejected(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::TransientFacilitator(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InsufficientCredit => StatusCode::PAYMENT_REQUIRED,
            GatewayError::LockConflict => StatusCode::CONFLICT,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(source) = &self {
            tracing::error!(error = %source, "internal error");
        }
        let status = self.status();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::Internal(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::InvalidFormat("x".into()).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(GatewayError::LockConflict.status(), StatusCode::CONFLICT);
        assert_eq!(
            GatewayError::TransientFacilitator("down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::InsufficientCredit.status(),
            StatusCode::PAYMENT_REQUIRED
        );
    }

    #[test]
    fn test_internal_message_is_generic() {
        let err = GatewayError::Internal(anyhow::anyhow!("connection string leaked"));
        assert_eq!(err.to_string(), "internal error");
    }
}
