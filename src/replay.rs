//! Replay defense: the used-reference set (§3, §4.3, §9).

use ethereum_types::H256;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Tracks settlement references that have already paid for a request.
///
/// Keyed on `(txHash, logIndex)` rather than bare `txHash` (§9's binding
/// resolution of the batch-vs-replay tension): a single batch transaction
/// can legitimately settle several distinct requirements, each bound to a
/// different log record within the same receipt.
///
/// The critical section is exactly the check-and-insert pair in
/// [`check_and_claim`] — never held across an `.await` (§5). Retention is
/// in-memory for this rewrite (§9); the API surface here is deliberately
/// narrow (no `HashSet` leaked to callers) so a persistent backing store
/// can replace the inner map without touching callers.
#[derive(Debug, Default)]
pub struct UsedReferenceSet {
    claimed: Mutex<HashSet<(H256, u64)>>,
}

impl UsedReferenceSet {
    pub fn new() -> Self {
        Self { claimed: Mutex::new(HashSet::new()) }
    }

    /// Atomically check whether `(tx_hash, log_index)` is unclaimed and, if
    /// so, claim it. Returns `true` when this call newly claimed the
    /// reference, `false` when it was already claimed (a replay).
    pub fn check_and_claim(&self, tx_hash: H256, log_index: u64) -> bool {
        let mut claimed = self.claimed.lock().expect("used-reference set poisoned");
        claimed.insert((tx_hash, log_index))
    }

    /// Whether `(tx_hash, log_index)` has already been claimed, without
    /// claiming it.
    pub fn contains(&self, tx_hash: H256, log_index: u64) -> bool {
        let claimed = self.claimed.lock().expect("used-reference set poisoned");
        claimed.contains(&(tx_hash, log_index))
    }

    pub fn len(&self) -> usize {
        self.claimed.lock().expect("used-reference set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracks the expiry stamped on a freshly issued challenge, keyed on
/// `(endpoint, body_hash)`.
///
/// The verify-on-retry path needs the expiry the client was actually
/// handed in the 402 body, not a brand-new one computed at verify time —
/// otherwise the staleness check in [`crate::ledger::LedgerClient::verify`]
/// can never fire (§4.2 step 1). Retention is in-memory and best-effort: a
/// miss (process restart, a retry with a different body, or a client that
/// settles upfront without ever seeing a 402) falls back in `middleware.rs`
/// to treating the challenge as freshly issued, keeping `handle()` usable
/// without a prior round trip.
#[derive(Debug, Default)]
pub struct IssuedChallenges {
    expiries: Mutex<HashMap<(String, [u8; 32]), u64>>,
}

impl IssuedChallenges {
    pub fn new() -> Self {
        Self { expiries: Mutex::new(HashMap::new()) }
    }

    /// Record the expiry stamped on a just-issued challenge, pruning
    /// already-expired entries while the lock is held so the map doesn't
    /// grow unbounded.
    pub fn record(&self, endpoint: &str, body_hash: [u8; 32], expiry: u64, now: u64) {
        let mut expiries = self.expiries.lock().expect("issued-challenge map poisoned");
        expiries.retain(|_, exp| *exp >= now);
        expiries.insert((endpoint.to_string(), body_hash), expiry);
    }

    /// The expiry originally stamped for this `(endpoint, body_hash)`, if
    /// a challenge for it is still on record.
    pub fn expiry_for(&self, endpoint: &str, body_hash: [u8; 32]) -> Option<u64> {
        let expiries = self.expiries.lock().expect("issued-challenge map poisoned");
        expiries.get(&(endpoint.to_string(), body_hash)).copied()
    }

    pub fn len(&self) -> usize {
        self.expiries.lock().expect("issued-challenge map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claim_succeeds_second_is_rejected() {
        let set = UsedReferenceSet::new();
        let tx = H256::repeat_byte(0xaa);

        assert!(set.check_and_claim(tx, 0));
        assert!(!set.check_and_claim(tx, 0));
    }

    #[test]
    fn distinct_log_indices_on_same_tx_hash_claim_independently() {
        let set = UsedReferenceSet::new();
        let tx = H256::repeat_byte(0xbb);

        assert!(set.check_and_claim(tx, 0));
        assert!(set.check_and_claim(tx, 1));
        assert!(set.check_and_claim(tx, 2));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn contains_does_not_claim() {
        let set = UsedReferenceSet::new();
        let tx = H256::repeat_byte(0xcc);

        assert!(!set.contains(tx, 0));
        assert!(set.check_and_claim(tx, 0));
        assert!(set.contains(tx, 0));
    }

    #[test]
    fn recorded_expiry_is_returned_for_the_same_endpoint_and_body() {
        let issued = IssuedChallenges::new();
        issued.record("POST /api/chat", [1u8; 32], 1_700_000_300, 1_700_000_000);
        assert_eq!(issued.expiry_for("POST /api/chat", [1u8; 32]), Some(1_700_000_300));
    }

    #[test]
    fn unknown_endpoint_or_body_misses() {
        let issued = IssuedChallenges::new();
        issued.record("POST /api/chat", [1u8; 32], 1_700_000_300, 1_700_000_000);
        assert_eq!(issued.expiry_for("POST /api/other", [1u8; 32]), None);
        assert_eq!(issued.expiry_for("POST /api/chat", [2u8; 32]), None);
    }

    #[test]
    fn recording_prunes_entries_that_have_already_expired() {
        let issued = IssuedChallenges::new();
        issued.record("POST /a", [1u8; 32], 100, 0);
        issued.record("POST /b", [2u8; 32], 200, 150);
        assert_eq!(issued.expiry_for("POST /a", [1u8; 32]), None);
        assert_eq!(issued.expiry_for("POST /b", [2u8; 32]), Some(200));
        assert_eq!(issued.len(), 1);
    }
}
