//! Minimal settlement client: hits a priced endpoint, pays the 402
//! challenge with a local signing key, and prints the final response.
//!
//! Run with: `cargo run --example client`

use agentgate::client::{ClientRequest, X402Client};
use agentgate::signer::{LocalSigner, Signer};
use ethereum_types::Address;
use std::str::FromStr;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let private_key = std::env::var("AGENTGATE_PRIVATE_KEY")
        .unwrap_or_else(|_| "0x".to_string() + &"11".repeat(32));
    let address = Address::from_str("0x209693Bc6afc0C5328bA36FaF03C514EF312287C").unwrap();
    let rpc_url = std::env::var("AGENTGATE_RPC_URL").unwrap_or_else(|_| "https://sepolia.base.org".to_string());

    let signer = Signer::Local(LocalSigner::new(private_key, address, rpc_url, 84532));
    let client = X402Client::new(signer).with_event_sink(|event| {
        tracing::info!(?event, "settlement event");
    });

    let request = ClientRequest::get("http://localhost:8080/api/chat");
    match client.fetch(request).await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            println!("status: {status}\nbody: {body}");
        }
        Err(error) => eprintln!("settlement failed: {error}"),
    }
}
