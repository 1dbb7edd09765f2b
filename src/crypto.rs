//! Cryptographic and numeric primitives shared across the protocol:
//! memo hashing, decimal amount scaling, and raw transaction signing for
//! the local-key signer (§4.1, §4.4, §9).

use crate::{Result, X402Error};
use ethereum_types::{Address, H256, U256};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Keccak-256, the hash function the EVM and this protocol's memo use.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    use sha3::{Digest, Keccak256};
    Keccak256::digest(data).into()
}

/// `Transfer(address,address,uint256)` event topic0.
pub fn transfer_event_signature() -> H256 {
    H256::from_slice(&keccak256(b"Transfer(address,address,uint256)"))
}

/// `TransferWithMemo(address,address,uint256,bytes32)` event topic0 — the
/// extended transfer event this protocol optionally recognizes (§4.2).
pub fn transfer_with_memo_event_signature() -> H256 {
    H256::from_slice(&keccak256(
        b"TransferWithMemo(address,address,uint256,bytes32)",
    ))
}

/// Deterministic, type-tagged, length-prefixed field encoding used by
/// [`compute_memo`]. Each field gets a 1-byte type tag and a 4-byte
/// big-endian length prefix before its bytes, so that no combination of
/// field boundaries can collide (§4.1).
fn encode_field(tag: u8, bytes: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

const TAG_STRING: u8 = 0x01;
const TAG_BYTES: u8 = 0x02;
const TAG_U64: u8 = 0x03;

/// Compute the 32-byte memo: `keccak256(endpoint ‖ bodyHash ‖ nonce ‖
/// expiry_u64)` under the deterministic encoding above (§4.1, §8: memo
/// determinism is a tested property — identical inputs produce identical
/// memos, and any single-field change changes the memo).
pub fn compute_memo(endpoint: &str, body_hash: [u8; 32], nonce: &str, expiry: u64) -> H256 {
    let mut buf = Vec::with_capacity(endpoint.len() + nonce.len() + 64);
    encode_field(TAG_STRING, endpoint.as_bytes(), &mut buf);
    encode_field(TAG_BYTES, &body_hash, &mut buf);
    encode_field(TAG_STRING, nonce.as_bytes(), &mut buf);
    encode_field(TAG_U64, &expiry.to_be_bytes(), &mut buf);
    H256::from_slice(&keccak256(&buf))
}

/// Parse a human decimal amount (e.g. `"0.01"`) into smallest-unit integer
/// representation for a token with `decimals` fractional digits, using
/// exact decimal arithmetic — never `f64` (§4.1, §9).
///
/// Fails with [`X402Error::InvalidAmount`] when the amount is non-positive
/// or carries more fractional digits than the token supports.
pub fn human_to_smallest(amount: &str, decimals: u8) -> Result<U256> {
    let decimal = Decimal::from_str(amount)
        .map_err(|_| X402Error::invalid_amount(format!("not a decimal: {amount}")))?;

    if decimal <= Decimal::ZERO {
        return Err(X402Error::invalid_amount("amount must be positive"));
    }
    if decimal.scale() > decimals as u32 {
        return Err(X402Error::invalid_amount(format!(
            "amount has more than {decimals} fractional digits"
        )));
    }

    let scaled = decimal * Decimal::from(10u64.pow(decimals as u32));
    let scaled = scaled.trunc();
    let digits = scaled.to_string();
    U256::from_dec_str(&digits)
        .map_err(|_| X402Error::invalid_amount("amount overflowed smallest-unit representation"))
}

/// The inverse of [`human_to_smallest`]: render a smallest-unit amount back
/// to its human decimal string for display (§3 `amountHuman`).
pub fn smallest_to_human(amount: U256, decimals: u8) -> String {
    let digits = amount.to_string();
    let decimals = decimals as usize;
    if digits.len() <= decimals {
        let padded = format!("{:0>width$}", digits, width = decimals + 1);
        let split = padded.len() - decimals;
        trim_trailing_zeros(&format!("{}.{}", &padded[..split], &padded[split..]))
    } else {
        let split = digits.len() - decimals;
        if decimals == 0 {
            digits
        } else {
            trim_trailing_zeros(&format!("{}.{}", &digits[..split], &digits[split..]))
        }
    }
}

fn trim_trailing_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let trimmed = s.trim_end_matches('0');
    let trimmed = trimmed.trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Parse a `0x`-prefixed hex address.
pub fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|_| X402Error::invalid_amount(format!("invalid address: {s}")))
}

/// Raw Ethereum legacy/EIP-155 transaction signing, used by [`crate::signer::LocalSigner`]
/// to submit ERC-20 transfers directly: the client settles with a real
/// on-chain transfer rather than a signed off-chain authorization.
pub mod txsign {
    use super::*;
    use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey};
    use rlp::RlpStream;

    /// Minimal legacy transaction fields needed for an ERC-20 `transfer`
    /// or `transferWithMemo` call.
    #[derive(Debug, Clone)]
    pub struct UnsignedTx {
        pub nonce: u64,
        pub gas_price: U256,
        pub gas_limit: U256,
        pub to: Address,
        pub value: U256,
        pub data: Vec<u8>,
        pub chain_id: u64,
    }

    fn encode_u256(stream: &mut RlpStream, value: U256) {
        if value.is_zero() {
            stream.append(&"");
            return;
        }
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(31);
        stream.append(&&bytes[first_nonzero..]);
    }

    fn rlp_encode(tx: &UnsignedTx, v: u64, r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut stream = RlpStream::new();
        stream.begin_list(9);
        stream.append(&tx.nonce);
        encode_u256(&mut stream, tx.gas_price);
        encode_u256(&mut stream, tx.gas_limit);
        stream.append(&tx.to.as_bytes());
        encode_u256(&mut stream, tx.value);
        stream.append(&tx.data);
        stream.append(&v);
        stream.append(&r);
        stream.append(&s);
        stream.out().to_vec()
    }

    /// Sign `tx` with `private_key` (32-byte hex, `0x`-prefixed or not)
    /// under EIP-155, returning the raw signed transaction bytes ready for
    /// `eth_sendRawTransaction`.
    pub fn sign(tx: &UnsignedTx, private_key: &str) -> Result<Vec<u8>> {
        let key_bytes = hex::decode(private_key.trim_start_matches("0x"))
            .map_err(|_| X402Error::signer_failed("invalid hex private key"))?;
        let signing_key = SigningKey::from_slice(&key_bytes)
            .map_err(|_| X402Error::signer_failed("invalid private key"))?;

        // EIP-155 signing hash: RLP(nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0)
        let unsigned_hash = {
            let mut stream = RlpStream::new();
            stream.begin_list(9);
            stream.append(&tx.nonce);
            encode_u256(&mut stream, tx.gas_price);
            encode_u256(&mut stream, tx.gas_limit);
            stream.append(&tx.to.as_bytes());
            encode_u256(&mut stream, tx.value);
            stream.append(&tx.data);
            stream.append(&tx.chain_id);
            stream.append(&"");
            stream.append(&"");
            keccak256(&stream.out())
        };

        let (signature, recovery_id): (K256Signature, RecoveryId) = signing_key
            .sign_prehash_recoverable(&unsigned_hash)
            .map_err(|e| X402Error::signer_failed(format!("signing failed: {e}")))?;

        let r = signature.r().to_bytes();
        let s = signature.s().to_bytes();
        let v = tx.chain_id * 2 + 35 + recovery_id.to_byte() as u64;

        Ok(rlp_encode(tx, v, &r, &s))
    }

    /// ERC-20 `transfer(address,uint256)` call data.
    pub fn encode_transfer_call(to: Address, amount: U256) -> Vec<u8> {
        let selector = &keccak256(b"transfer(address,uint256)")[..4];
        let mut data = Vec::with_capacity(4 + 64);
        data.extend_from_slice(selector);
        let mut to_padded = [0u8; 32];
        to_padded[12..].copy_from_slice(to.as_bytes());
        data.extend_from_slice(&to_padded);
        let mut amount_bytes = [0u8; 32];
        amount.to_big_endian(&mut amount_bytes);
        data.extend_from_slice(&amount_bytes);
        data
    }

    /// `transferWithMemo(address,uint256,bytes32)` call data — the
    /// extension this protocol optionally uses to embed the memo on-chain
    /// for reconciliation (§3).
    pub fn encode_transfer_with_memo_call(to: Address, amount: U256, memo: H256) -> Vec<u8> {
        let selector = &keccak256(b"transferWithMemo(address,uint256,bytes32)")[..4];
        let mut data = Vec::with_capacity(4 + 96);
        data.extend_from_slice(selector);
        let mut to_padded = [0u8; 32];
        to_padded[12..].copy_from_slice(to.as_bytes());
        data.extend_from_slice(&to_padded);
        let mut amount_bytes = [0u8; 32];
        amount.to_big_endian(&mut amount_bytes);
        data.extend_from_slice(&amount_bytes);
        data.extend_from_slice(memo.as_bytes());
        data
    }

    /// `batchTransfer(address[],uint256[],bytes32[])` call data for a
    /// multicall contract: packs N recipients/amounts/memos into one
    /// atomic transaction, the basis for the client's batch settlement
    /// path (§4.5). Encoding is a fixed-layout simplification of full ABI
    /// dynamic-array encoding — sufficient for this crate's own multicall
    /// contract, not a general ABI encoder.
    pub fn encode_batch_transfer_call(transfers: Vec<(Address, U256, Option<H256>)>) -> Vec<u8> {
        let selector = &keccak256(b"batchTransfer(address[],uint256[],bytes32[])")[..4];
        let count = transfers.len() as u64;
        let mut data = Vec::with_capacity(4 + 32 + transfers.len() * 96);
        data.extend_from_slice(selector);
        data.extend_from_slice(&count.to_be_bytes());
        for (recipient, amount, memo) in transfers {
            let mut to_padded = [0u8; 32];
            to_padded[12..].copy_from_slice(recipient.as_bytes());
            data.extend_from_slice(&to_padded);
            let mut amount_bytes = [0u8; 32];
            amount.to_big_endian(&mut amount_bytes);
            data.extend_from_slice(&amount_bytes);
            data.extend_from_slice(memo.unwrap_or(H256::zero()).as_bytes());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_is_deterministic() {
        let body_hash = keccak256(b"body");
        let a = compute_memo("POST /api/chat", body_hash, "nonce-1", 1_700_000_000);
        let b = compute_memo("POST /api/chat", body_hash, "nonce-1", 1_700_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn memo_changes_with_any_single_field() {
        let body_hash = keccak256(b"body");
        let base = compute_memo("POST /api/chat", body_hash, "nonce-1", 1_700_000_000);

        assert_ne!(base, compute_memo("GET /api/chat", body_hash, "nonce-1", 1_700_000_000));
        assert_ne!(
            base,
            compute_memo("POST /api/chat", keccak256(b"other"), "nonce-1", 1_700_000_000)
        );
        assert_ne!(base, compute_memo("POST /api/chat", body_hash, "nonce-2", 1_700_000_000));
        assert_ne!(base, compute_memo("POST /api/chat", body_hash, "nonce-1", 1_700_000_001));
    }

    #[test]
    fn scaling_round_trips_for_typical_decimals() {
        for amount in ["0.01", "0.005", "1", "1234.56", "0.000001"] {
            let smallest = human_to_smallest(amount, 6).unwrap();
            let back = smallest_to_human(smallest, 6);
            assert_eq!(back, amount, "round trip failed for {amount}");
        }
    }

    #[test]
    fn scaling_rejects_non_positive_amounts() {
        assert!(human_to_smallest("0", 6).is_err());
        assert!(human_to_smallest("-1", 6).is_err());
    }

    #[test]
    fn scaling_rejects_excess_fractional_digits() {
        assert!(human_to_smallest("0.0000001", 6).is_err());
        assert!(human_to_smallest("0.000001", 6).is_ok());
    }

    #[test]
    fn scaling_matches_scenario_from_spec() {
        // "0.005" at 6 decimals -> 5000 smallest units (§8 scenario 2).
        let smallest = human_to_smallest("0.005", 6).unwrap();
        assert_eq!(smallest, U256::from(5000u64));
    }

    #[test]
    fn transfer_event_signatures_are_distinct() {
        assert_ne!(transfer_event_signature(), transfer_with_memo_event_signature());
    }
}
