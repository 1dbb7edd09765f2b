//! # agentgate — HTTP 402 payment-gateway middleware
//!
//! A paywall middleware and settlement client implementing a challenge/settle
//! protocol over HTTP 402: a client calling a priced endpoint without proof
//! of payment receives a machine-readable payment requirement, performs a
//! token transfer on a public ledger, and retries the request carrying a
//! settlement reference the middleware verifies against the ledger.
//!
//! - [`types`] — wire types: payment requirement, settlement reference,
//!   memo derivation, pricing table (C1).
//! - [`ledger`] — fetches a transaction receipt and checks it against a
//!   requirement (C2).
//! - [`middleware`] — the transport-agnostic paywall state machine (C3).
//! - [`signer`] — local-key and remote-custody signing (C4).
//! - [`client`] — the settlement engine: 402 interception, single/parallel/
//!   batch settlement, retry (C5).
//! - [`replay`] — the used-reference set (replay defense).
//! - [`revenue`] — operational counters, not protocol-critical.
//! - [`axum`] — the one reference framework integration (feature `axum`).

pub mod client;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod replay;
pub mod revenue;
pub mod signer;
pub mod types;

pub use client::X402Client;
pub use error::{Result, X402Error};
pub use middleware::PaywallMiddleware;
pub use signer::Signer;

#[cfg(feature = "axum")]
pub mod axum;

/// Current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version carried in the discovery document and 402 bodies.
pub const X402_VERSION: u32 = types::PROTOCOL_VERSION;
