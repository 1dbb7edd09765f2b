//! Minimal Axum server exposing one priced endpoint behind the paywall.
//!
//! Run with: `cargo run --example axum_server --features axum`

use agentgate::middleware::{PaywallConfig, PaywallMiddleware};
use agentgate::types::{endpoint_key, PricingEntry, PricingTable, TokenInfo};
use axum::routing::post;
use axum::{Json, Router};
use ethereum_types::Address;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let recipient = Address::from_str("0x209693Bc6afc0C5328bA36FaF03C514EF312287C").unwrap();
    let token = TokenInfo {
        symbol: "USDC".to_string(),
        address: Address::from_str("0x036CbD53842c5426634e7929541eC2318f3dCF7e").unwrap(),
        decimals: 6,
    };

    let mut pricing = HashMap::new();
    pricing.insert(
        endpoint_key("POST", "/api/chat"),
        PricingEntry::new("0.005").with_description("One chat completion"),
    );
    let pricing = PricingTable::new(pricing);

    let rpc_url = std::env::var("AGENTGATE_RPC_URL").unwrap_or_else(|_| "https://sepolia.base.org".to_string());
    let config = PaywallConfig::new(recipient, token, pricing, 84532, rpc_url)
        .with_service_name("agentgate-demo");

    let middleware = Arc::new(PaywallMiddleware::new(config).with_hook(|observed| {
        tracing::info!(
            from = %observed.from,
            amount = %observed.amount,
            endpoint = %observed.endpoint,
            "payment observed"
        );
    }));

    let protected = Router::new().route(
        "/api/chat",
        post(|| async { Json(json!({"reply": "hello from the paid endpoint"})) }),
    );

    let app = agentgate::axum::paywall_router(middleware, protected);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
    tracing::info!("listening on 0.0.0.0:8080");
    axum::serve(listener, app).await.unwrap();
}
