//! Session-cookie verification.
//!
//! The identity subsystem (account login, TOTP, device trust) lives outside
//! this service. Its whole contract here is a signed cookie carrying the
//! account id and whether the device passed a second factor:
//!
//! ```text
//! sh_session=<account-uuid>.<0|1>.<hmac-sha256-hex>
//! ```

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::handlers::AppState;

pub const SESSION_COOKIE: &str = "sh_session";

type HmacSha256 = Hmac<Sha256>;

/// An authenticated browser session.
#[derive(Debug, Clone)]
pub struct Session {
    pub account_id: Uuid,
    pub device_trusted: bool,
}

/// Sign a session value. Exposed for the identity service and tests.
pub fn encode_session(secret: &str, account_id: Uuid, device_trusted: bool) -> String {
    let trusted = if device_trusted { "1" } else { "0" };
    let body = format!("{account_id}.{trusted}");
    format!("{body}.{}", sign(secret, &body))
}

/// Verify a session cookie value.
pub fn verify_session(secret: &str, value: &str) -> Option<Session> {
    let (body, mac_hex) = value.rsplit_once('.')?;
    let expected = sign(secret, body);

    // Constant-time comparison through the Mac verify API.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body.as_bytes());
    let provided = hex::decode(mac_hex).ok()?;
    mac.verify_slice(&provided).ok()?;
    debug_assert_eq!(expected, mac_hex);

    let (account_id, trusted) = body.split_once('.')?;
    Some(Session {
        account_id: Uuid::parse_str(account_id).ok()?,
        device_trusted: trusted == "1",
    })
}

fn sign(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

impl FromRequestParts<AppState> for Session {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.config.session_secret.is_empty() {
            return Err(GatewayError::Unauthorized("sessions are not enabled".into()));
        }

        let cookies = parts
            .headers
            .get(axum::http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GatewayError::Unauthorized("Missing session cookie".into()))?;

        let value = cookie_value(cookies, SESSION_COOKIE)
            .ok_or_else(|| GatewayError::Unauthorized("Missing session cookie".into()))?;

        verify_session(&state.config.session_secret, value)
            .ok_or_else(|| GatewayError::Unauthorized("Invalid session".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_round_trip() {
        let account_id = Uuid::new_v4();
        let value = encode_session("secret", account_id, true);
        let session = verify_session("secret", &value).unwrap();
        assert_eq!(session.account_id, account_id);
        assert!(session.device_trusted);
    }

    #[test]
    fn test_session_rejects_tampering() {
        let account_id = Uuid::new_v4();
        let value = encode_session("secret", account_id, false);

        // Flip the device-trusted flag without re-signing
        let forged = value.replacen(".0.", ".1.", 1);
        assert!(verify_session("secret", &forged).is_none());

        // Wrong secret
        assert!(verify_session("other-secret", &value).is_none());

        // Garbage
        assert!(verify_session("secret", "not-a-session").is_none());
    }

    #[test]
    fn test_cookie_value_parsing() {
        let header = "a=1; sh_session=abc.def; b=2";
        assert_eq!(cookie_value(header, SESSION_COOKIE), Some("abc.def"));
        assert_eq!(cookie_value(header, "missing"), None);
    }
}
