//! Signer Abstraction (C4): polymorphic over a local key signer and a
//! remote custody signer behind one non-branching interface (§4.4, §9).
//!
//! Callers dispatch through [`Signer`]'s inherent methods; they never match
//! on the variant themselves. `supports_batch()` and
//! `supports_concurrent_submission()` are the capability probes the client
//! settlement engine (C5) queries before choosing a fan-out strategy.

use ethereum_types::{Address, H256, U256};
use std::str::FromStr;
use std::time::Duration;

use crate::crypto::txsign::{self, UnsignedTx};
use crate::{Result, X402Error};

/// A transfer request the settlement engine asks a signer to submit.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub token_contract: Address,
    pub recipient: Address,
    pub amount: U256,
    pub memo: Option<H256>,
}

/// Polymorphic signer: a local private key, or a remote custody API
/// (§4.4). Both variants share the same capability surface.
#[derive(Clone)]
pub enum Signer {
    Local(LocalSigner),
    RemoteCustody(CustodySigner),
}

impl Signer {
    /// Submit a single ERC-20 transfer, awaiting at least one confirmation
    /// before returning (§4.4).
    pub async fn submit_transfer(&self, request: TransferRequest) -> Result<H256> {
        match self {
            Signer::Local(signer) => signer.submit_transfer(request).await,
            Signer::RemoteCustody(signer) => signer.submit_transfer(request).await,
        }
    }

    /// Submit many transfers as one atomic multi-call transaction. Only
    /// meaningful when [`Self::supports_batch`] returns `true` (§4.5).
    pub async fn submit_batch_transfer(&self, requests: Vec<TransferRequest>) -> Result<H256> {
        match self {
            Signer::Local(signer) => signer.submit_batch_transfer(requests).await,
            Signer::RemoteCustody(_) => {
                Err(X402Error::signer_failed("remote custody signer does not support batching"))
            }
        }
    }

    pub async fn resolve_address(&self) -> Result<Address> {
        match self {
            Signer::Local(signer) => signer.resolve_address(),
            Signer::RemoteCustody(signer) => signer.resolve_address().await,
        }
    }

    pub async fn get_balance(&self, token_contract: Address) -> Result<U256> {
        match self {
            Signer::Local(signer) => signer.get_balance(token_contract).await,
            Signer::RemoteCustody(signer) => signer.get_balance(token_contract).await,
        }
    }

    /// Whether this signer can pack multiple transfers into one atomic
    /// on-chain transaction (§4.4, §4.5). Only the local-key variant can.
    pub fn supports_batch(&self) -> bool {
        matches!(self, Signer::Local(_))
    }

    /// Whether the target ledger is expected to tolerate more than one
    /// pending transaction from this signer's account at once (§4.5, §9).
    /// `fetch_many` falls back to a sequential pipeline when this is false.
    pub fn supports_concurrent_submission(&self) -> bool {
        match self {
            Signer::Local(_) => true,
            Signer::RemoteCustody(_) => false,
        }
    }
}

/// Holds a private key in memory; signs and submits transactions directly
/// against the RPC endpoint (§4.4).
#[derive(Clone)]
pub struct LocalSigner {
    private_key: String,
    address: Address,
    rpc_url: String,
    chain_id: u64,
    http: reqwest::Client,
}

impl LocalSigner {
    pub fn new(private_key: impl Into<String>, address: Address, rpc_url: impl Into<String>, chain_id: u64) -> Self {
        Self {
            private_key: private_key.into(),
            address,
            rpc_url: rpc_url.into(),
            chain_id,
            http: reqwest::Client::new(),
        }
    }

    async fn next_nonce(&self) -> Result<u64> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_getTransactionCount",
            "params": [format!("{:#x}", self.address), "pending"],
            "id": 1,
        });
        let response: serde_json::Value = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| X402Error::signer_failed(format!("nonce lookup failed: {e}")))?
            .json()
            .await
            .map_err(|e| X402Error::signer_failed(format!("malformed nonce response: {e}")))?;

        let hex_nonce = response["result"]
            .as_str()
            .ok_or_else(|| X402Error::signer_failed("missing nonce in RPC response"))?;
        u64::from_str_radix(hex_nonce.trim_start_matches("0x"), 16)
            .map_err(|_| X402Error::signer_failed("malformed nonce hex"))
    }

    async fn gas_price(&self) -> Result<U256> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_gasPrice",
            "params": [],
            "id": 1,
        });
        let response: serde_json::Value = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| X402Error::signer_failed(format!("gas price lookup failed: {e}")))?
            .json()
            .await
            .map_err(|e| X402Error::signer_failed(format!("malformed gas price response: {e}")))?;

        let hex_price = response["result"]
            .as_str()
            .ok_or_else(|| X402Error::signer_failed("missing gasPrice in RPC response"))?;
        U256::from_str_radix(hex_price.trim_start_matches("0x"), 16)
            .map_err(|_| X402Error::signer_failed("malformed gasPrice hex"))
    }

    async fn send_raw(&self, raw: Vec<u8>) -> Result<H256> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_sendRawTransaction",
            "params": [format!("0x{}", hex::encode(&raw))],
            "id": 1,
        });
        let response: serde_json::Value = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| X402Error::signer_failed(format!("submit failed: {e}")))?
            .json()
            .await
            .map_err(|e| X402Error::signer_failed(format!("malformed submit response: {e}")))?;

        if let Some(error) = response.get("error") {
            return Err(X402Error::signer_failed(format!("RPC rejected transaction: {error}")));
        }
        let hex_hash = response["result"]
            .as_str()
            .ok_or_else(|| X402Error::signer_failed("missing txHash in submit response"))?;
        H256::from_str(hex_hash).map_err(|_| X402Error::signer_failed("malformed txHash"))
    }

    /// Poll `eth_getTransactionReceipt` until one confirmation lands, or
    /// give up after a bounded number of attempts (§4.4: "awaits at least
    /// one confirmation before returning").
    async fn await_confirmation(&self, tx_hash: H256) -> Result<()> {
        const MAX_POLLS: u32 = 30;
        for _ in 0..MAX_POLLS {
            let body = serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_getTransactionReceipt",
                "params": [format!("{:#x}", tx_hash)],
                "id": 1,
            });
            let response: serde_json::Value = self
                .http
                .post(&self.rpc_url)
                .json(&body)
                .send()
                .await
                .map_err(|e| X402Error::signer_failed(format!("confirmation poll failed: {e}")))?
                .json()
                .await
                .map_err(|e| X402Error::signer_failed(format!("malformed receipt response: {e}")))?;

            if !response["result"].is_null() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(X402Error::signer_failed("timed out waiting for confirmation"))
    }

    async fn submit_transfer(&self, request: TransferRequest) -> Result<H256> {
        let data = match request.memo {
            Some(memo) => txsign::encode_transfer_with_memo_call(request.recipient, request.amount, memo),
            None => txsign::encode_transfer_call(request.recipient, request.amount),
        };
        let tx = UnsignedTx {
            nonce: self.next_nonce().await?,
            gas_price: self.gas_price().await?,
            gas_limit: U256::from(100_000u64),
            to: request.token_contract,
            value: U256::zero(),
            data,
            chain_id: self.chain_id,
        };
        let raw = txsign::sign(&tx, &self.private_key)?;
        let tx_hash = self.send_raw(raw).await?;
        self.await_confirmation(tx_hash).await?;
        Ok(tx_hash)
    }

    /// Packs all transfers into one call to a `batchTransfer(address[]
    /// tokens, address[] recipients, uint256[] amounts)` entry point on a
    /// multicall contract. All settlements land atomically or none do
    /// (§4.5's batch atomicity contract) — this is a property of the
    /// on-chain call, not of this function.
    async fn submit_batch_transfer(&self, requests: Vec<TransferRequest>) -> Result<H256> {
        if requests.is_empty() {
            return Err(X402Error::signer_failed("empty batch"));
        }
        // All batched transfers in one receipt must share a token contract
        // for this crate's simple multicall encoding; requirements to
        // different tokens must fall back to sequential settlement.
        let token = requests[0].token_contract;
        let data = txsign::encode_batch_transfer_call(
            requests.iter().map(|r| (r.recipient, r.amount, r.memo)).collect(),
        );
        let tx = UnsignedTx {
            nonce: self.next_nonce().await?,
            gas_price: self.gas_price().await?,
            gas_limit: U256::from(100_000u64 * requests.len() as u64),
            to: token,
            value: U256::zero(),
            data,
            chain_id: self.chain_id,
        };
        let raw = txsign::sign(&tx, &self.private_key)?;
        let tx_hash = self.send_raw(raw).await?;
        self.await_confirmation(tx_hash).await?;
        Ok(tx_hash)
    }

    fn resolve_address(&self) -> Result<Address> {
        Ok(self.address)
    }

    async fn get_balance(&self, token_contract: Address) -> Result<U256> {
        fetch_erc20_balance(&self.http, &self.rpc_url, token_contract, self.address).await
    }
}

/// Delegates signing to an external HTTPS custody API identified by
/// (app id, app secret, wallet id); authenticates with HTTP Basic
/// credentials (§4.4). A `sponsor_fees` flag requests the custody service
/// cover gas; on an explicit sponsorship-rejected response the client
/// retries once without it.
#[derive(Clone)]
pub struct CustodySigner {
    api_base: String,
    app_id: String,
    app_secret: String,
    wallet_id: String,
    sponsor_fees: bool,
    http: reqwest::Client,
}

impl CustodySigner {
    pub fn new(
        api_base: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        wallet_id: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            wallet_id: wallet_id.into(),
            sponsor_fees: false,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_sponsor_fees(mut self, sponsor: bool) -> Self {
        self.sponsor_fees = sponsor;
        self
    }

    async fn post_submission(&self, request: &TransferRequest, sponsor: bool) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "walletId": self.wallet_id,
            "tokenContract": format!("{:#x}", request.token_contract),
            "recipient": format!("{:#x}", request.recipient),
            "amount": request.amount.to_string(),
            "memo": request.memo.map(|m| format!("{:#x}", m)),
            "sponsorFees": sponsor,
        });

        self.http
            .post(format!("{}/v1/transfers", self.api_base))
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| X402Error::signer_failed(format!("custody submission failed: {e}")))?
            .json()
            .await
            .map_err(|e| X402Error::signer_failed(format!("malformed custody response: {e}")))
    }

    async fn submit_transfer(&self, request: TransferRequest) -> Result<H256> {
        let mut response = self.post_submission(&request, self.sponsor_fees).await?;

        // Retry once without sponsorship when the custody API explicitly
        // rejects the sponsored-fees request (§4.4).
        if self.sponsor_fees && response["error"].as_str() == Some("sponsorship_rejected") {
            response = self.post_submission(&request, false).await?;
        }

        if let Some(error) = response.get("error") {
            return Err(X402Error::signer_failed(format!("custody API error: {error}")));
        }
        let hex_hash = response["txHash"]
            .as_str()
            .ok_or_else(|| X402Error::signer_failed("missing txHash in custody response"))?;
        H256::from_str(hex_hash).map_err(|_| X402Error::signer_failed("malformed txHash"))
    }

    async fn resolve_address(&self) -> Result<Address> {
        let response: serde_json::Value = self
            .http
            .get(format!("{}/v1/wallets/{}", self.api_base, self.wallet_id))
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .send()
            .await
            .map_err(|e| X402Error::signer_failed(format!("wallet lookup failed: {e}")))?
            .json()
            .await
            .map_err(|e| X402Error::signer_failed(format!("malformed wallet response: {e}")))?;

        let hex_addr = response["address"]
            .as_str()
            .ok_or_else(|| X402Error::signer_failed("missing address in wallet response"))?;
        Address::from_str(hex_addr).map_err(|_| X402Error::signer_failed("malformed wallet address"))
    }

    async fn get_balance(&self, token_contract: Address) -> Result<U256> {
        let response: serde_json::Value = self
            .http
            .get(format!(
                "{}/v1/wallets/{}/balances/{:#x}",
                self.api_base, self.wallet_id, token_contract
            ))
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .send()
            .await
            .map_err(|e| X402Error::signer_failed(format!("balance lookup failed: {e}")))?
            .json()
            .await
            .map_err(|e| X402Error::signer_failed(format!("malformed balance response: {e}")))?;

        let digits = response["balance"]
            .as_str()
            .ok_or_else(|| X402Error::signer_failed("missing balance in response"))?;
        U256::from_dec_str(digits).map_err(|_| X402Error::signer_failed("malformed balance"))
    }
}

async fn fetch_erc20_balance(
    http: &reqwest::Client,
    rpc_url: &str,
    token_contract: Address,
    owner: Address,
) -> Result<U256> {
    let selector = &crate::crypto::keccak256(b"balanceOf(address)")[..4];
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(selector);
    let mut padded = [0u8; 32];
    padded[12..].copy_from_slice(owner.as_bytes());
    data.extend_from_slice(&padded);

    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "eth_call",
        "params": [{"to": format!("{:#x}", token_contract), "data": format!("0x{}", hex::encode(&data))}, "latest"],
        "id": 1,
    });
    let response: serde_json::Value = http
        .post(rpc_url)
        .json(&body)
        .send()
        .await
        .map_err(|e| X402Error::signer_failed(format!("balance call failed: {e}")))?
        .json()
        .await
        .map_err(|e| X402Error::signer_failed(format!("malformed balance call response: {e}")))?;

    let hex_result = response["result"]
        .as_str()
        .ok_or_else(|| X402Error::signer_failed("missing result in balance call"))?;
    U256::from_str_radix(hex_result.trim_start_matches("0x"), 16)
        .map_err(|_| X402Error::signer_failed("malformed balance result"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_signer_supports_batch_and_concurrent_submission() {
        let signer = Signer::Local(LocalSigner::new(
            "0x".to_string() + &"11".repeat(32),
            Address::repeat_byte(0x01),
            "http://localhost:8545".to_string(),
            8453,
        ));
        assert!(signer.supports_batch());
        assert!(signer.supports_concurrent_submission());
    }

    #[test]
    fn custody_signer_does_not_support_batch_or_concurrent_submission() {
        let signer = Signer::RemoteCustody(CustodySigner::new(
            "https://custody.example.com",
            "app-id",
            "app-secret",
            "wallet-1",
        ));
        assert!(!signer.supports_batch());
        assert!(!signer.supports_concurrent_submission());
    }
}
