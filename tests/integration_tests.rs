//! End-to-end paywall scenarios, driven over an in-process Axum router
//! (§8): unpriced passthrough, challenge issuance, malformed header,
//! successful settlement against a mocked ledger RPC, and replay rejection
//! of a reused settlement reference.

use agentgate::axum::paywall_router;
use agentgate::middleware::{PaywallConfig, PaywallMiddleware};
use agentgate::types::{endpoint_key, PricingEntry, PricingTable, TokenInfo};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use ethereum_types::{Address, H256};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHAIN_ID: u64 = 8453;

fn token() -> TokenInfo {
    TokenInfo { symbol: "USDC".to_string(), address: Address::repeat_byte(0x11), decimals: 6 }
}

fn topic_for_address(address: Address) -> String {
    let mut padded = [0u8; 32];
    padded[12..].copy_from_slice(address.as_bytes());
    format!("0x{}", hex::encode(padded))
}

fn middleware_with_rpc(rpc_url: String) -> Arc<PaywallMiddleware> {
    let mut map = HashMap::new();
    map.insert(endpoint_key("POST", "/api/chat"), PricingEntry::new("0.005"));
    let pricing = PricingTable::new(map);
    let config = PaywallConfig::new(Address::repeat_byte(0x22), token(), pricing, CHAIN_ID, rpc_url);
    Arc::new(PaywallMiddleware::new(config))
}

fn router(middleware: Arc<PaywallMiddleware>) -> Router {
    paywall_router(middleware, Router::new().route("/api/chat", axum::routing::post(|| async { "reply" })))
}

async fn mock_receipt_server(payer: Address, recipient: Address, value: ethereum_types::U256) -> MockServer {
    let server = MockServer::start().await;
    let transfer_topic = format!("0x{:x}", agentgate::crypto::transfer_event_signature());
    let mut value_bytes = [0u8; 32];
    value.to_big_endian(&mut value_bytes);

    let receipt = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "status": "0x1",
            "blockNumber": "0x2a",
            "logs": [{
                "address": format!("{:#x}", token().address),
                "topics": [transfer_topic, topic_for_address(payer), topic_for_address(recipient)],
                "data": format!("0x{}", hex::encode(value_bytes)),
                "logIndex": "0x0",
            }],
        },
    });

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(receipt))
        .mount(&server)
        .await;
    server
}

/// A receipt whose only transfer log is `TransferWithMemo` to the right
/// recipient, but carrying a memo that doesn't match the requirement's.
async fn mock_memo_mismatch_server(payer: Address, recipient: Address, value: ethereum_types::U256) -> MockServer {
    let server = MockServer::start().await;
    let memo_topic = format!("0x{:x}", agentgate::crypto::transfer_with_memo_event_signature());
    let mut value_bytes = [0u8; 32];
    value.to_big_endian(&mut value_bytes);
    let wrong_memo = [0xEEu8; 32];

    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(&value_bytes);
    data.extend_from_slice(&wrong_memo);

    let receipt = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "status": "0x1",
            "blockNumber": "0x2a",
            "logs": [{
                "address": format!("{:#x}", token().address),
                "topics": [memo_topic, topic_for_address(payer), topic_for_address(recipient)],
                "data": format!("0x{}", hex::encode(data)),
                "logIndex": "0x0",
            }],
        },
    });

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(receipt))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn unpriced_path_passes_through_without_any_header() {
    let server = MockServer::start().await;
    let middleware = middleware_with_rpc(server.uri());
    let app = paywall_router(middleware, Router::new().route("/public", get(|| async { "ok" })));

    let response =
        app.oneshot(Request::builder().uri("/public").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn priced_path_without_header_returns_a_challenge() {
    let server = MockServer::start().await;
    let middleware = middleware_with_rpc(server.uri());
    let app = router(middleware);

    let response = app
        .oneshot(Request::builder().method("POST").uri("/api/chat").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(
        response.headers().get("X-Payment-Amount").unwrap().to_str().unwrap(),
        "5000"
    );

    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["payment"]["amountRequired"], "5000");
}

#[tokio::test]
async fn malformed_payment_header_is_rejected_before_any_rpc_call() {
    let server = MockServer::start().await;
    let middleware = middleware_with_rpc(server.uri());
    let app = router(middleware);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("X-Payment", "not-a-reference")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    // No mocks were registered on `server`, so any RPC call would have
    // panicked wiremock's unmatched-request guard; reaching here confirms
    // the middleware short-circuited before touching the ledger.
}

#[tokio::test]
async fn valid_settlement_is_admitted_and_a_replayed_reference_is_rejected() {
    let payer = Address::repeat_byte(0x99);
    let recipient = Address::repeat_byte(0x22); // matches the configured paywall recipient below
    let value = ethereum_types::U256::from(5000u64);
    let server = mock_receipt_server(payer, recipient, value).await;

    let middleware = middleware_with_rpc(server.uri());
    let app = router(middleware);

    let tx_hash = H256::repeat_byte(0xab);
    let header_value = format!("{:#x}:{}", tx_hash, CHAIN_ID);

    let first = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("X-Payment", &header_value)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("X-Payment", &header_value)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn transfer_with_memo_log_carrying_the_wrong_memo_is_rejected_as_memo_mismatch() {
    let payer = Address::repeat_byte(0x99);
    let recipient = Address::repeat_byte(0x22);
    let value = ethereum_types::U256::from(5000u64);
    let server = mock_memo_mismatch_server(payer, recipient, value).await;

    let middleware = middleware_with_rpc(server.uri());
    let app = router(middleware);

    let tx_hash = H256::repeat_byte(0xcd);
    let header_value = format!("{:#x}:{}", tx_hash, CHAIN_ID);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("X-Payment", &header_value)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["code"], "MEMO_MISMATCH");
}
