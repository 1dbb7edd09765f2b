//! Core wire types for the payment protocol (Protocol Model, C1).

use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::crypto;
use crate::{Result, X402Error};

/// Protocol version carried in the discovery document.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default expiry window for a freshly issued requirement, in seconds.
pub const DEFAULT_EXPIRY_SECONDS: u64 = 300;

/// Token metadata attached to a requirement and to the discovery document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

/// A payment requirement, issued in a 402 body (§3, §6).
///
/// Constructed once per challenged request via [`build_requirement`] and
/// discarded once the response is flushed — the server does not need to
/// remember it to verify a later retry (§4.2, "stateless verification").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub recipient_address: Address,
    pub token_address: Address,
    pub token_symbol: String,
    /// Smallest-unit amount, rendered as a decimal string to avoid any
    /// precision loss in JSON's native number type.
    pub amount_required: String,
    /// Human display amount, e.g. `"0.01"`.
    pub amount_human: String,
    /// `"METHOD path"`, e.g. `"POST /api/chat"`.
    pub endpoint: String,
    pub nonce: String,
    pub expiry: u64,
    pub chain_id: u64,
    pub memo: H256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PaymentRequirement {
    /// The smallest-unit amount as a [`U256`], parsed back out of
    /// `amount_required`. Infallible for requirements this crate built
    /// itself; kept fallible because the type also deserializes external
    /// input (a client echoing a requirement back, or a test fixture).
    pub fn amount(&self) -> Result<U256> {
        U256::from_dec_str(&self.amount_required)
            .map_err(|_| X402Error::invalid_amount("amountRequired is not a valid integer"))
    }
}

/// Build a payment requirement for one challenged request (§4.1 "Build
/// requirement").
///
/// `amount_human` is a decimal string such as `"0.01"`; it is scaled to
/// smallest units using exact decimal arithmetic, never `f64`. The memo is
/// derived deterministically from `(endpoint, body_hash, nonce, expiry)`.
#[allow(clippy::too_many_arguments)]
pub fn build_requirement(
    recipient: Address,
    token: &TokenInfo,
    amount_human: &str,
    endpoint: &str,
    body_hash: [u8; 32],
    nonce: String,
    expiry: u64,
    chain_id: u64,
    description: Option<String>,
) -> Result<PaymentRequirement> {
    let amount = crypto::human_to_smallest(amount_human, token.decimals)?;
    let memo = crypto::compute_memo(endpoint, body_hash, &nonce, expiry);

    Ok(PaymentRequirement {
        recipient_address: recipient,
        token_address: token.address,
        token_symbol: token.symbol.clone(),
        amount_required: amount.to_string(),
        amount_human: crypto::smallest_to_human(amount, token.decimals),
        endpoint: endpoint.to_string(),
        nonce,
        expiry,
        chain_id,
        memo,
        description,
    })
}

/// A settlement reference: `<txHash>:<chainId>`, the value of the
/// `X-Payment` header (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SettlementReference {
    pub tx_hash: H256,
    pub chain_id: u64,
}

impl SettlementReference {
    /// Parse a settlement header value. Splits on the last colon (`txHash`
    /// never itself contains one, but splitting from the right is
    /// defensive regardless); `txHash` must be `0x`-prefixed 32-byte hex,
    /// `chainId` must parse as a decimal `u64`. Returns `None` rather than
    /// an error — the caller (middleware) maps absence to `400` itself.
    pub fn parse(header: &str) -> Option<Self> {
        let (hash_part, chain_part) = header.rsplit_once(':')?;
        let chain_id: u64 = chain_part.parse().ok()?;

        let hex_part = hash_part.strip_prefix("0x").or_else(|| hash_part.strip_prefix("0X"))?;
        if hex_part.len() != 64 {
            return None;
        }
        let bytes = hex::decode(hex_part).ok()?;
        let tx_hash = H256::from_slice(&bytes);

        Some(Self { tx_hash, chain_id })
    }

    /// Format back to the canonical header value. Output is always
    /// lower-case hex, regardless of the case the input was parsed from
    /// (§4.1: round-trips modulo hex case).
    pub fn format(&self) -> String {
        format!("{:#x}:{}", self.tx_hash, self.chain_id)
    }
}

impl std::fmt::Display for SettlementReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// One entry in the pricing table (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    /// Decimal display amount, e.g. `"0.01"`.
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_override: Option<TokenInfo>,
}

impl PricingEntry {
    pub fn new(amount: impl Into<String>) -> Self {
        Self { amount: amount.into(), description: None, token_override: None }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_token_override(mut self, token: TokenInfo) -> Self {
        self.token_override = Some(token);
        self
    }
}

/// Read-only pricing table, keyed on `"METHOD path"` (§3, §4.3). Immutable
/// after construction; reconfiguration replaces the whole `Arc`.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: Arc<HashMap<String, PricingEntry>>,
}

impl PricingTable {
    pub fn new(entries: HashMap<String, PricingEntry>) -> Self {
        Self { entries: Arc::new(entries) }
    }

    /// Look up the price for an exact `"METHOD path"` key. Path parameters
    /// are not wildcarded; unlisted paths return `None` (UNPRICED, §4.3).
    pub fn lookup(&self, endpoint: &str) -> Option<&PricingEntry> {
        self.entries.get(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&String, &PricingEntry)> {
        self.entries.iter()
    }
}

/// `endpoint("POST", "/api/chat") == "POST /api/chat"`, the canonical
/// pricing-table key (§3, §4.3).
pub fn endpoint_key(method: &str, path: &str) -> String {
    format!("{method} {path}")
}

/// Opaque, globally-unique nonce for a freshly issued requirement (§3, §4.1).
pub fn generate_nonce() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current wall-clock time as unix seconds, used to compute a requirement's
/// expiry from the middleware's configured expiry window.
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// 402 response body (§6). Deserialize is needed on the client side, which
/// parses this shape back out of a challenged response (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequiredBody {
    pub error: String,
    pub payment: PaymentRequirement,
    pub instructions: PaymentInstructions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInstructions {
    pub header: String,
    pub format: String,
    pub steps: Vec<String>,
}

impl PaymentRequiredBody {
    pub fn new(payment: PaymentRequirement) -> Self {
        Self {
            error: "Payment Required".to_string(),
            instructions: PaymentInstructions {
                header: "X-Payment".to_string(),
                format: "<txHash>:<chainId>".to_string(),
                steps: vec![
                    format!(
                        "Transfer {} {} to {:#x}",
                        payment.amount_human, payment.token_symbol, payment.recipient_address
                    ),
                    "Include X-Payment: <txHash>:<chainId> on the retried request".to_string(),
                    "Retry the original request".to_string(),
                ],
            },
            payment,
        }
    }
}

/// `GET /.well-known/x-agentgate.json` discovery document (§6).
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResponse {
    pub name: String,
    pub version: u32,
    pub chain: DiscoveryChain,
    pub token: TokenInfo,
    pub recipient: Address,
    pub endpoints: Vec<DiscoveryEndpoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryChain {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryEndpoint {
    pub method: String,
    pub path: String,
    pub price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> TokenInfo {
        TokenInfo { symbol: "USDC".to_string(), address: Address::repeat_byte(0x11), decimals: 6 }
    }

    #[test]
    fn build_requirement_scales_amount_to_smallest_units() {
        let req = build_requirement(
            Address::repeat_byte(0x22),
            &token(),
            "0.005",
            "POST /api/chat",
            crypto::keccak256(b"{}"),
            "nonce-1".to_string(),
            1_700_000_300,
            8453,
            None,
        )
        .unwrap();

        assert_eq!(req.amount_required, "5000");
        assert_eq!(req.amount_human, "0.005");
    }

    #[test]
    fn build_requirement_rejects_non_positive_amount() {
        let result = build_requirement(
            Address::repeat_byte(0x22),
            &token(),
            "0",
            "POST /api/chat",
            crypto::keccak256(b"{}"),
            "nonce-1".to_string(),
            1_700_000_300,
            8453,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn settlement_reference_round_trips() {
        let valid = format!("0x{}:{}", "11".repeat(32), 8453);
        let parsed = SettlementReference::parse(&valid).expect("should parse");
        assert_eq!(parsed.chain_id, 8453);
        assert_eq!(parsed.format(), valid);
    }

    #[test]
    fn settlement_reference_parse_rejects_malformed_input() {
        assert!(SettlementReference::parse("notvalid").is_none());
        assert!(SettlementReference::parse("0xdeadbeef:notanumber").is_none());
        assert!(SettlementReference::parse(&format!("{}:8453", "11".repeat(32))).is_none());
    }

    #[test]
    fn settlement_reference_parse_is_case_insensitive_on_hex() {
        let lower = format!("0x{}:8453", "ab".repeat(32));
        let upper = format!("0x{}:8453", "AB".repeat(32));
        assert_eq!(SettlementReference::parse(&lower), SettlementReference::parse(&upper));
    }

    #[test]
    fn pricing_table_is_exact_match_only() {
        let mut map = HashMap::new();
        map.insert(endpoint_key("POST", "/api/chat"), PricingEntry::new("0.01"));
        let table = PricingTable::new(map);

        assert!(table.lookup("POST /api/chat").is_some());
        assert!(table.lookup("POST /api/chat/123").is_none());
        assert!(table.lookup("GET /api/chat").is_none());
    }
}
