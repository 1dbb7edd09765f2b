//! Ledger Verifier (C2): fetches a transaction receipt over JSON-RPC and
//! checks it against a payment requirement (§4.2).
//!
//! Talks to the ledger over plain JSON-RPC via `reqwest` rather than
//! pulling in a full chain SDK — the only RPC method this verifier needs
//! is `eth_getTransactionReceipt`.

use ethereum_types::{Address, H256, U256};
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{transfer_event_signature, transfer_with_memo_event_signature};
use crate::types::PaymentRequirement;
use crate::{Result, X402Error};

/// Outcome of a successful verification (§4.2 step 8).
#[derive(Debug, Clone)]
pub struct Verification {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub tx_hash: H256,
    pub block_number: u64,
    /// Index of the log record this requirement was bound to — the key
    /// component the used-reference set claims (§9).
    pub log_index: u64,
}

/// Thin JSON-RPC client over a single EVM-compatible endpoint.
#[derive(Clone)]
pub struct LedgerClient {
    rpc_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawReceipt {
    status: Option<String>,
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    logs: Vec<RawLog>,
}

#[derive(Debug, Deserialize)]
struct RawLog {
    address: String,
    topics: Vec<String>,
    data: String,
    #[serde(rename = "logIndex")]
    log_index: String,
}

impl LedgerClient {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self { rpc_url: rpc_url.into(), http: reqwest::Client::new() }
    }

    async fn call_receipt(&self, tx_hash: H256) -> Result<Option<RawReceipt>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_getTransactionReceipt",
            "params": [format!("{:#x}", tx_hash)],
            "id": 1,
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| X402Error::rpc_unavailable(format!("request failed: {e}")))?;

        let parsed: RpcResponse<RawReceipt> = response
            .json()
            .await
            .map_err(|e| X402Error::rpc_unavailable(format!("malformed RPC response: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(X402Error::rpc_unavailable(error.message));
        }

        Ok(parsed.result)
    }

    /// Verify a settlement reference against `requirement` (§4.2 algorithm,
    /// steps 1-8). Stateless with respect to any prior requirement: every
    /// fact needed is recomputed from the receipt and the requirement
    /// itself.
    pub async fn verify(&self, tx_hash: H256, requirement: &PaymentRequirement) -> Result<Verification> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs();
        if now > requirement.expiry {
            return Err(X402Error::Expired);
        }

        let receipt = self
            .call_receipt(tx_hash)
            .await?
            .ok_or_else(|| X402Error::rpc_unavailable("transaction receipt not found"))?;

        let status_ok = receipt
            .status
            .as_deref()
            .map(|s| s != "0x0")
            .unwrap_or(true);
        if !status_ok {
            return Err(X402Error::TxReverted);
        }

        let block_number = receipt
            .block_number
            .as_deref()
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0);

        let required_amount = requirement.amount()?;
        let transfer_topic = transfer_event_signature();
        let transfer_with_memo_topic = transfer_with_memo_event_signature();

        // (is_memo, log_index, from, to, value, memo)
        let mut best: Option<(bool, u64, Address, Address, U256, H256)> = None;
        // Tracks whether a TransferWithMemo log matched recipient/token but
        // carried the wrong memo, so a receipt with no other acceptable log
        // fails as `MemoMismatch` rather than the less specific
        // `NoMatchingTransfer` (§4.2 step 7).
        let mut memo_mismatch_seen = false;

        for log in &receipt.logs {
            let emitter = match log.address.parse::<Address>() {
                Ok(a) => a,
                Err(_) => continue,
            };
            if emitter != requirement.token_address {
                continue;
            }
            if log.topics.is_empty() {
                continue;
            }
            let topic0 = match log.topics[0].parse::<H256>() {
                Ok(t) => t,
                Err(_) => continue,
            };

            let (is_memo, from, to, value, memo) = if topic0 == transfer_with_memo_topic {
                decode_transfer_with_memo(log)
            } else if topic0 == transfer_topic {
                decode_transfer(log)
            } else {
                continue;
            };

            let (from, to, value, memo) = match (from, to, value, memo) {
                (Some(from), Some(to), Some(value), memo) => (from, to, value, memo),
                _ => continue,
            };

            if to != requirement.recipient_address {
                continue;
            }

            // Reject a TransferWithMemo whose memo mismatches; a plain
            // Transfer is accepted regardless of the requirement's memo
            // (permissive reading, §4.2 step 7 / §9).
            if is_memo {
                if let Some(memo) = memo {
                    if requirement.memo != H256::zero() && memo != requirement.memo {
                        memo_mismatch_seen = true;
                        continue;
                    }
                }
            }

            let log_index = u64::from_str_radix(log.log_index.trim_start_matches("0x"), 16)
                .unwrap_or(u64::MAX);

            // Tie-break: memo match beats plain transfer; among equal kind,
            // lowest log index wins (§4.2).
            let candidate = (is_memo, log_index, from, to, value, memo.unwrap_or(H256::zero()));
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    if candidate.0 && !current.0 {
                        candidate
                    } else if candidate.0 == current.0 && candidate.1 < current.1 {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }

        let (_, log_index, from, to, value, _) = match best {
            Some(candidate) => candidate,
            None if memo_mismatch_seen => return Err(X402Error::MemoMismatch),
            None => return Err(X402Error::NoMatchingTransfer),
        };

        if value < required_amount {
            return Err(X402Error::Insufficient);
        }

        Ok(Verification { from, to, amount: value, tx_hash, block_number, log_index })
    }
}

type DecodedLog = (bool, Option<Address>, Option<Address>, Option<U256>, Option<H256>);

fn decode_transfer(log: &RawLog) -> DecodedLog {
    // Transfer(address indexed from, address indexed to, uint256 value):
    // `from` is topics[1], `to` is topics[2]; value is the non-indexed data word.
    if log.topics.len() < 3 {
        return (false, None, None, None, None);
    }
    let from = topic_to_address(&log.topics[1]);
    let to = topic_to_address(&log.topics[2]);
    let value = hex_to_u256(&log.data);
    (false, from, to, value, None)
}

fn decode_transfer_with_memo(log: &RawLog) -> DecodedLog {
    // TransferWithMemo(address indexed from, address indexed to, uint256 value, bytes32 memo):
    // value and memo are both in data, 32 bytes each, value first.
    if log.topics.len() < 3 {
        return (true, None, None, None, None);
    }
    let from = topic_to_address(&log.topics[1]);
    let to = topic_to_address(&log.topics[2]);
    let data = match hex::decode(log.data.trim_start_matches("0x")) {
        Ok(d) => d,
        Err(_) => return (true, from, to, None, None),
    };
    if data.len() < 64 {
        return (true, from, to, None, None);
    }
    let value = U256::from_big_endian(&data[0..32]);
    let memo = H256::from_slice(&data[32..64]);
    (true, from, to, Some(value), Some(memo))
}

fn topic_to_address(topic: &str) -> Option<Address> {
    let bytes = hex::decode(topic.trim_start_matches("0x")).ok()?;
    if bytes.len() < 20 {
        return None;
    }
    Some(Address::from_slice(&bytes[bytes.len() - 20..]))
}

fn hex_to_u256(data: &str) -> Option<U256> {
    let bytes = hex::decode(data.trim_start_matches("0x")).ok()?;
    if bytes.is_empty() {
        return None;
    }
    Some(U256::from_big_endian(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_to_address_extracts_trailing_twenty_bytes() {
        let topic = format!("0x{}{}", "0".repeat(24), "11".repeat(20));
        let addr = topic_to_address(&topic).unwrap();
        assert_eq!(addr, Address::repeat_byte(0x11));
    }

    #[test]
    fn hex_to_u256_parses_value() {
        let data = format!("0x{:064x}", 5000u64);
        assert_eq!(hex_to_u256(&data).unwrap(), U256::from(5000u64));
    }
}
