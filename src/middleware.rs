//! Paywall Middleware (C3): maps request to price, emits 402 on a missing
//! header, verifies the settlement header on retry, enforces replay
//! defense, and invokes the payment-observed hook (§4.3).
//!
//! This module is transport-agnostic: [`PaywallMiddleware::handle`] takes
//! method/path/header/body-hash and returns a [`Decision`], independent of
//! any web framework. [`crate::axum`] is a thin adapter on top of it.

use ethereum_types::Address;
use std::sync::Arc;

use crate::ledger::LedgerClient;
use crate::replay::{IssuedChallenges, UsedReferenceSet};
use crate::revenue::{AcceptedSettlement, RevenueCounters};
use crate::types::{
    self, endpoint_key, DiscoveryChain, DiscoveryEndpoint, DiscoveryResponse, PaymentRequiredBody,
    PaymentRequirement, PricingTable, SettlementReference, TokenInfo,
};
use crate::{Result, X402Error};

/// Construction-time configuration for a [`PaywallMiddleware`] instance
/// (§4.3).
#[derive(Clone)]
pub struct PaywallConfig {
    pub recipient: Address,
    pub token: TokenInfo,
    pub pricing: PricingTable,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Expiry window for freshly issued requirements, in seconds. Default
    /// `300` per §4.3.
    pub expiry_seconds: u64,
    pub service_name: String,
}

impl PaywallConfig {
    pub fn new(
        recipient: Address,
        token: TokenInfo,
        pricing: PricingTable,
        chain_id: u64,
        rpc_url: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            token,
            pricing,
            chain_id,
            rpc_url: rpc_url.into(),
            expiry_seconds: types::DEFAULT_EXPIRY_SECONDS,
            service_name: "agentgate".to_string(),
        }
    }

    pub fn with_expiry_seconds(mut self, expiry_seconds: u64) -> Self {
        self.expiry_seconds = expiry_seconds;
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }
}

/// Payment metadata handed to the payment-observed hook, once per admitted
/// request (§3, §4.3 "Hook").
#[derive(Debug, Clone)]
pub struct PaymentObserved {
    pub from: Address,
    pub amount: ethereum_types::U256,
    pub endpoint: String,
    pub tx_hash: ethereum_types::H256,
    pub log_index: u64,
}

/// The per-request state machine's terminal outcome (§4.3).
#[derive(Debug)]
pub enum Decision {
    /// Path not in the pricing table; the request bypasses the paywall
    /// entirely.
    Unpriced,
    /// No `X-Payment` header; 402 with a freshly built requirement.
    ChallengeIssued(Box<PaymentRequiredBody>),
    /// Header present but unparseable; 400.
    HeaderMalformed,
    /// Header parsed to a reference already claimed; 409.
    Replay,
    /// Verification succeeded and the reference was newly claimed; the
    /// handler should run.
    Admitted(PaymentObserved),
    /// Verification failed; 402 with the error's code.
    Rejected(X402Error),
}

/// Transport-agnostic paywall core. Framework adapters (e.g.
/// [`crate::axum`]) own request/response plumbing; this type owns the
/// protocol state machine.
#[derive(Clone)]
pub struct PaywallMiddleware {
    config: Arc<PaywallConfig>,
    ledger: LedgerClient,
    used: Arc<UsedReferenceSet>,
    issued: Arc<IssuedChallenges>,
    revenue: Arc<RevenueCounters>,
    hook: Option<Arc<dyn Fn(&PaymentObserved) + Send + Sync>>,
}

impl PaywallMiddleware {
    pub fn new(config: PaywallConfig) -> Self {
        let ledger = LedgerClient::new(config.rpc_url.clone());
        Self {
            config: Arc::new(config),
            ledger,
            used: Arc::new(UsedReferenceSet::new()),
            issued: Arc::new(IssuedChallenges::new()),
            revenue: Arc::new(RevenueCounters::new()),
            hook: None,
        }
    }

    /// Share a used-reference set across middleware instances (e.g. across
    /// replicas behind the same process, or to inject one for test
    /// isolation — §9 "inject them as explicit dependencies").
    pub fn with_used_reference_set(mut self, used: Arc<UsedReferenceSet>) -> Self {
        self.used = used;
        self
    }

    /// Share the issued-challenge expiry registry across middleware
    /// instances, same rationale as [`Self::with_used_reference_set`].
    pub fn with_issued_challenges(mut self, issued: Arc<IssuedChallenges>) -> Self {
        self.issued = issued;
        self
    }

    pub fn with_revenue_counters(mut self, revenue: Arc<RevenueCounters>) -> Self {
        self.revenue = revenue;
        self
    }

    pub fn with_hook(mut self, hook: impl Fn(&PaymentObserved) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn revenue(&self) -> &RevenueCounters {
        &self.revenue
    }

    pub fn config(&self) -> &PaywallConfig {
        &self.config
    }

    /// Run the per-request state machine for one request (§4.3).
    ///
    /// `body_hash` is the keccak256 of the request body (used as part of
    /// the memo fingerprint, §4.1); callers that don't need memo binding
    /// may pass the hash of an empty body.
    pub async fn handle(
        &self,
        method: &str,
        path: &str,
        payment_header: Option<&str>,
        body_hash: [u8; 32],
    ) -> Decision {
        self.revenue.record_request();
        let endpoint = endpoint_key(method, path);

        let entry = match self.config.pricing.lookup(&endpoint) {
            Some(entry) => entry,
            None => return Decision::Unpriced,
        };

        let token = entry.token_override.clone().unwrap_or_else(|| self.config.token.clone());

        match payment_header {
            None => {
                let now = types::now_unix();
                let expiry = now + self.config.expiry_seconds;
                let requirement = types::build_requirement(
                    self.config.recipient,
                    &token,
                    &entry.amount,
                    &endpoint,
                    body_hash,
                    types::generate_nonce(),
                    expiry,
                    self.config.chain_id,
                    entry.description.clone(),
                );
                match requirement {
                    Ok(requirement) => {
                        self.issued.record(&endpoint, body_hash, expiry, now);
                        tracing::info!(endpoint = %endpoint, "challenge issued");
                        Decision::ChallengeIssued(Box::new(PaymentRequiredBody::new(requirement)))
                    }
                    Err(error) => Decision::Rejected(error),
                }
            }
            Some(header) => {
                let reference = match SettlementReference::parse(header) {
                    Some(reference) => reference,
                    None => return Decision::HeaderMalformed,
                };

                // Use the expiry actually stamped on the challenge this
                // endpoint/body last issued, so staleness is judged
                // against when the client was first handed the
                // requirement, not against a freshly computed window that
                // can never have elapsed (§4.2 step 1). A miss (no prior
                // challenge on record for this endpoint/body — a client
                // that settles upfront, a process restart, or a differing
                // body) falls back to a fresh window so verification stays
                // usable without a round trip first.
                let now = types::now_unix();
                let expiry = self
                    .issued
                    .expiry_for(&endpoint, body_hash)
                    .unwrap_or(now + self.config.expiry_seconds);
                let requirement = match types::build_requirement(
                    self.config.recipient,
                    &token,
                    &entry.amount,
                    &endpoint,
                    body_hash,
                    types::generate_nonce(),
                    expiry,
                    self.config.chain_id,
                    entry.description.clone(),
                ) {
                    Ok(requirement) => requirement,
                    Err(error) => return Decision::Rejected(error),
                };

                match self.ledger.verify(reference.tx_hash, &requirement).await {
                    Ok(verification) => {
                        // Claim before the hook runs and before the handler
                        // runs — this ordering closes the replay race
                        // between two concurrent retries of the same
                        // reference (§4.3, §5).
                        if !self.used.check_and_claim(verification.tx_hash, verification.log_index) {
                            tracing::warn!(endpoint = %endpoint, tx_hash = %verification.tx_hash, "replay rejected");
                            return Decision::Replay;
                        }

                        let observed = PaymentObserved {
                            from: verification.from,
                            amount: verification.amount,
                            endpoint: endpoint.clone(),
                            tx_hash: verification.tx_hash,
                            log_index: verification.log_index,
                        };

                        self.revenue.record_settlement(AcceptedSettlement {
                            from: observed.from,
                            amount: observed.amount,
                            endpoint: observed.endpoint.clone(),
                            tx_hash: observed.tx_hash,
                            log_index: observed.log_index,
                        });

                        if let Some(hook) = &self.hook {
                            // Fire-and-forget: a hook panic must not fail
                            // admission (§7). catch_unwind requires
                            // UnwindSafe; the hook is a plain Fn closure so
                            // we accept the narrower guarantee that hook
                            // errors (not panics) are the expected failure
                            // mode here and log them via tracing inside the
                            // caller-supplied closure itself.
                            hook(&observed);
                        }

                        tracing::info!(endpoint = %endpoint, tx_hash = %observed.tx_hash, "admitted");
                        Decision::Admitted(observed)
                    }
                    Err(error) => {
                        tracing::warn!(endpoint = %endpoint, error = %error, "verification rejected");
                        Decision::Rejected(error)
                    }
                }
            }
        }
    }

    /// Build the discovery document (§6).
    pub fn discovery(&self) -> DiscoveryResponse {
        DiscoveryResponse {
            name: self.config.service_name.clone(),
            version: types::PROTOCOL_VERSION,
            chain: DiscoveryChain { id: self.config.chain_id, name: self.config.service_name.clone() },
            token: self.config.token.clone(),
            recipient: self.config.recipient,
            endpoints: self
                .config
                .pricing
                .endpoints()
                .map(|(key, entry)| {
                    let (method, path) = key.split_once(' ').unwrap_or(("GET", key.as_str()));
                    DiscoveryEndpoint {
                        method: method.to_string(),
                        path: path.to_string(),
                        price: entry.amount.clone(),
                        description: entry.description.clone(),
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PricingEntry, PricingTable};
    use std::collections::HashMap;

    fn token() -> TokenInfo {
        TokenInfo { symbol: "USDC".to_string(), address: Address::repeat_byte(0x11), decimals: 6 }
    }

    fn middleware() -> PaywallMiddleware {
        let mut map = HashMap::new();
        map.insert(endpoint_key("POST", "/api/chat"), PricingEntry::new("0.005"));
        let pricing = PricingTable::new(map);
        let config = PaywallConfig::new(
            Address::repeat_byte(0x22),
            token(),
            pricing,
            8453,
            "http://localhost:8545",
        );
        PaywallMiddleware::new(config)
    }

    #[tokio::test]
    async fn unpriced_path_bypasses_the_paywall() {
        let middleware = middleware();
        let decision = middleware.handle("GET", "/public", None, [0u8; 32]).await;
        assert!(matches!(decision, Decision::Unpriced));
    }

    #[tokio::test]
    async fn missing_header_issues_a_challenge() {
        let middleware = middleware();
        let decision = middleware.handle("POST", "/api/chat", None, [0u8; 32]).await;
        match decision {
            Decision::ChallengeIssued(body) => {
                assert_eq!(body.payment.amount_required, "5000");
                assert_eq!(body.payment.recipient_address, Address::repeat_byte(0x22));
            }
            other => panic!("expected ChallengeIssued, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_header_is_rejected_before_touching_the_ledger() {
        let middleware = middleware();
        let decision = middleware.handle("POST", "/api/chat", Some("notvalid"), [0u8; 32]).await;
        assert!(matches!(decision, Decision::HeaderMalformed));
    }

    /// A challenge whose recorded expiry has already passed is rejected as
    /// `Expired` on retry — reachable through `handle()` itself, not just
    /// by constructing a `PaymentRequirement` directly, since the recorded
    /// expiry (not a freshly computed one) is what verification checks.
    #[tokio::test]
    async fn retry_against_an_expired_recorded_challenge_is_rejected_as_expired() {
        let middleware = middleware();
        let endpoint = endpoint_key("POST", "/api/chat");
        middleware.issued.record(&endpoint, [0u8; 32], 1, 1);

        let header = format!("{:#x}:{}", ethereum_types::H256::repeat_byte(0x01), 8453);
        let decision = middleware.handle("POST", "/api/chat", Some(&header), [0u8; 32]).await;
        match decision {
            Decision::Rejected(X402Error::Expired) => {}
            other => panic!("expected Rejected(Expired), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_recorded_expiry_falls_back_to_a_fresh_window() {
        // No prior `handle(None, ...)` call recorded an expiry for this
        // endpoint/body, so verification falls back to a fresh window
        // rather than treating the settlement as stale.
        let middleware = middleware();
        let header = format!("{:#x}:{}", ethereum_types::H256::repeat_byte(0x02), 8453);
        let decision = middleware.handle("POST", "/api/chat", Some(&header), [0u8; 32]).await;
        assert!(!matches!(decision, Decision::Rejected(X402Error::Expired)));
    }
}
