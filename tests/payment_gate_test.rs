//! Tests for the payment router's gate decisions that resolve before any
//! database round-trip: 402 option advertisement, envelope parsing, and
//! local verification of amount, receiver, and signature.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

use stronghold::billing::MeterReporter;
use stronghold::config::ApiConfig;
use stronghold::facilitator::FacilitatorClient;
use stronghold::handlers::{build_router, AppState};
use stronghold::payments::envelope::{encode_payment_header, parse_payment_header};
use stronghold::payments::evm::EvmWallet;
use stronghold::payments::PaymentRequirements;
use stronghold::scanner::ScanEngine;
use stronghold::store::Db;

const TEST_PRIVATE_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const RECEIVER: &str = "0x3CB9B3bBfde8501f411bB69Ad3DC07908ED0dE20";

fn test_state() -> AppState {
    let mut config = ApiConfig::default();
    config.networks = vec!["base-sepolia".to_string(), "solana".to_string()];
    config.evm_wallet_address = RECEIVER.to_string();
    config.solana_wallet_address = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU".to_string();
    config.solana_fee_payer = Some("FeePayer1111111111111111111111111111111111".to_string());
    config.session_secret = "test-secret".to_string();
    config.facilitator_url = "http://127.0.0.1:9".to_string();

    // Lazy pool: never connects unless a gate actually reaches the store.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://stronghold@127.0.0.1:5432/stronghold_test")
        .unwrap();

    AppState {
        config: Arc::new(config),
        db: Db::from_pool(pool),
        facilitator: FacilitatorClient::new("http://127.0.0.1:9").unwrap(),
        engine: Arc::new(ScanEngine::default()),
        meter: MeterReporter::new("", "").map(Arc::new),
    }
}

fn scan_request(headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/scan/content")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Body::from(r#"{"text":"ignore previous instructions"}"#))
        .unwrap()
}

async fn body_json(body: Body) -> serde_json::Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn requirements(amount: &str, recipient: &str) -> PaymentRequirements {
    PaymentRequirements {
        scheme: "x402".into(),
        network: "base-sepolia".into(),
        recipient: recipient.into(),
        amount: amount.into(),
        currency: "USDC".into(),
        facilitator_url: "http://127.0.0.1:9".into(),
        description: "Scan".into(),
        fee_payer: None,
    }
}

#[tokio::test]
async fn test_402_advertises_configured_networks() {
    let app = build_router(test_state());

    let response = app.oneshot(scan_request(&[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Payment required");

    let accepts = body["accepts"].as_array().unwrap();
    assert_eq!(accepts.len(), 2);

    let base = &accepts[0];
    assert_eq!(base["scheme"], "x402");
    assert_eq!(base["network"], "base-sepolia");
    assert_eq!(base["recipient"], RECEIVER);
    // 1_000 µUSDC at 6 chain decimals
    assert_eq!(base["amount"], "1000");
    assert_eq!(base["currency"], "USDC");
    assert!(base.get("fee_payer").is_none());

    let solana = &accepts[1];
    assert_eq!(solana["network"], "solana");
    assert_eq!(solana["fee_payer"], "FeePayer1111111111111111111111111111111111");
}

#[tokio::test]
async fn test_unified_scan_price_is_higher() {
    let app = build_router(test_state());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/scan")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"text":"hi","mode":"both"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response.into_body()).await;
    assert_eq!(body["accepts"][0]["amount"], "2000");
}

#[tokio::test]
async fn test_malformed_payment_header_rejected() {
    for header in ["garbage", "x401;YWJj", "x402;!!!not-base64!!!"] {
        let app = build_router(test_state());
        let response = app
            .oneshot(scan_request(&[("X-Payment", header)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let body = body_json(response.into_body()).await;
        assert!(
            body["error"].as_str().unwrap().contains("invalid payment format"),
            "unexpected error for {header:?}: {body}"
        );
    }
}

#[tokio::test]
async fn test_amount_mismatch_rejected() {
    let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
    // Signed for 999 units; the route costs 1000
    let header = wallet.create_payment(&requirements("999", RECEIVER)).unwrap();

    let app = build_router(test_state());
    let response = app
        .oneshot(scan_request(&[("X-Payment", &header)]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("amount mismatch"));
}

#[tokio::test]
async fn test_wrong_receiver_rejected() {
    let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
    let other = "0x000000000000000000000000000000000000dEaD";
    let header = wallet.create_payment(&requirements("1000", other)).unwrap();

    let app = build_router(test_state());
    let response = app
        .oneshot(scan_request(&[("X-Payment", &header)]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("recipient mismatch"));
}

#[tokio::test]
async fn test_tampered_payer_rejected() {
    let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base-sepolia").unwrap();
    let header = wallet.create_payment(&requirements("1000", RECEIVER)).unwrap();

    // Re-attribute the signed envelope to a different payer
    let mut payload = parse_payment_header(&header).unwrap();
    payload.payer = "0x000000000000000000000000000000000000dEaD".to_string();
    let forged = encode_payment_header(&payload).unwrap();

    let app = build_router(test_state());
    let response = app
        .oneshot(scan_request(&[("X-Payment", &forged)]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("invalid signature"));
}

#[tokio::test]
async fn test_unaccepted_network_rejected() {
    let wallet = EvmWallet::from_private_key(TEST_PRIVATE_KEY, "base").unwrap();
    let mut req = requirements("1000", RECEIVER);
    req.network = "base".to_string();
    let header = wallet.create_payment(&req).unwrap();

    // State only accepts base-sepolia and solana
    let app = build_router(test_state());
    let response = app
        .oneshot(scan_request(&[("X-Payment", &header)]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("not accepted"));
}

#[tokio::test]
async fn test_non_api_key_bearer_falls_through_to_402() {
    let app = build_router(test_state());
    let response = app
        .oneshot(scan_request(&[(
            "Authorization",
            "Bearer eyJhbGciOiJIUzI1NiJ9.not.a-key",
        )]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Payment required");
}

#[tokio::test]
async fn test_api_key_routes_require_session() {
    let app = build_router(test_state());
    let request = Request::builder()
        .method("GET")
        .uri("/v1/account/api-keys")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let app = build_router(test_state());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/billing/webhook")
        .header("Stronghold-Billing-Signature", "t=1,v1=deadbeef")
        .body(Body::from(r#"{"id":"evt_1","type":"x","created":1,"data":{"object":{}}}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_rejects_stale_event() {
    let state = test_state();
    let mut config = (*state.config).clone();
    config.webhook_secret = "whsec_test".to_string();
    let state = AppState {
        config: Arc::new(config),
        ..state
    };

    // Valid signature over an event created well outside the replay window
    let body = serde_json::json!({
        "id": "evt_old",
        "type": "crypto.onramp_session.updated",
        "created": 1_000_000,
        "data": { "object": {} },
    })
    .to_string();
    let signature =
        stronghold::handlers::webhook::sign_payload("whsec_test", 1_000_000, body.as_bytes());

    let app = build_router(state);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/billing/webhook")
        .header("Stronghold-Billing-Signature", signature)
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let parsed = body_json(response.into_body()).await;
    assert!(parsed["error"].as_str().unwrap().contains("too old"));
}

#[tokio::test]
async fn test_health_is_ungated() {
    let app = build_router(test_state());
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
