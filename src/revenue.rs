//! Revenue counters: operational, not protocol-critical, introspection into
//! accepted settlements (§3). Updated strictly after the used-reference set's
//! check-and-claim succeeds, outside any lock held by the claim itself (§5).

use ethereum_types::{Address, H256, U256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Bound on the accepted-settlement ring buffer (§3: "N ≈ 100").
const RING_BUFFER_CAPACITY: usize = 100;

/// One accepted settlement, retained for introspection.
#[derive(Debug, Clone)]
pub struct AcceptedSettlement {
    pub from: Address,
    pub amount: U256,
    pub endpoint: String,
    pub tx_hash: H256,
    pub log_index: u64,
}

/// Process-wide totals plus a bounded ring buffer of the most recent
/// accepted settlements.
#[derive(Debug, Default)]
pub struct RevenueCounters {
    request_count: AtomicU64,
    paid_count: AtomicU64,
    cumulative_amount: Mutex<U256>,
    recent: Mutex<VecDeque<AcceptedSettlement>>,
}

impl RevenueCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one incoming request, regardless of outcome.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one admitted, paid request.
    pub fn record_settlement(&self, settlement: AcceptedSettlement) {
        self.paid_count.fetch_add(1, Ordering::Relaxed);

        let mut cumulative = self.cumulative_amount.lock().expect("revenue counters poisoned");
        *cumulative += settlement.amount;
        drop(cumulative);

        let mut recent = self.recent.lock().expect("revenue counters poisoned");
        if recent.len() == RING_BUFFER_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(settlement);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn paid_count(&self) -> u64 {
        self.paid_count.load(Ordering::Relaxed)
    }

    pub fn cumulative_amount(&self) -> U256 {
        *self.cumulative_amount.lock().expect("revenue counters poisoned")
    }

    pub fn recent_settlements(&self) -> Vec<AcceptedSettlement> {
        self.recent.lock().expect("revenue counters poisoned").iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settlement(amount: u64) -> AcceptedSettlement {
        AcceptedSettlement {
            from: Address::repeat_byte(0x11),
            amount: U256::from(amount),
            endpoint: "POST /api/chat".to_string(),
            tx_hash: H256::repeat_byte(0x22),
            log_index: 0,
        }
    }

    #[test]
    fn tracks_totals_and_cumulative_amount() {
        let counters = RevenueCounters::new();
        counters.record_request();
        counters.record_request();
        counters.record_settlement(settlement(5000));

        assert_eq!(counters.request_count(), 2);
        assert_eq!(counters.paid_count(), 1);
        assert_eq!(counters.cumulative_amount(), U256::from(5000u64));
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let counters = RevenueCounters::new();
        for i in 0..150u64 {
            counters.record_settlement(settlement(i));
        }
        assert_eq!(counters.recent_settlements().len(), RING_BUFFER_CAPACITY);
    }
}
