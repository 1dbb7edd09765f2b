//! Settlement Engine / Client (C5): intercepts 402 responses, drives an
//! optional balance precheck, submits settlement via the [`Signer`]
//! (single, parallel, or batched), and retries with the settlement
//! reference attached (§4.5).

use ethereum_types::H256;
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::signer::{Signer, TransferRequest};
use crate::types::PaymentRequiredBody;
use crate::{Result, X402Error};

/// Structured events the client emits as it drives a settlement, via a
/// fire-and-forget callback rather than a blocking channel.
#[derive(Debug, Clone)]
pub enum PaymentEvent {
    PaymentRequired { endpoint: String, amount_required: String },
    PaymentSending,
    PaymentConfirmed { tx_hash: H256 },
    Retrying { attempt: u32 },
}

/// Construction-time configuration for [`X402Client`] (§4.5).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub precheck_balance: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout_ms: 60_000, max_retries: 3, precheck_balance: true }
    }
}

/// A request descriptor the client can retry with a rebuilt header, since
/// `reqwest::Request` itself isn't cheaply replayable across attempts.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl ClientRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: HeaderMap::new(), body: None }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| X402Error::invalid_header(format!("invalid header name: {key}")))?;
        let val = HeaderValue::from_str(value)
            .map_err(|_| X402Error::invalid_header(format!("invalid header value: {value}")))?;
        self.headers.insert(name, val);
        Ok(self)
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    fn build(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut builder = client.request(self.method.clone(), &self.url).headers(self.headers.clone());
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

/// Wraps a plain HTTP transport with 402 interception and settlement
/// (§4.5).
#[derive(Clone)]
pub struct X402Client {
    http: reqwest::Client,
    signer: Signer,
    config: ClientConfig,
    events: Option<Arc<dyn Fn(PaymentEvent) + Send + Sync>>,
}

impl X402Client {
    pub fn new(signer: Signer) -> Self {
        Self::with_config(signer, ClientConfig::default())
    }

    pub fn with_config(signer: Signer, config: ClientConfig) -> Self {
        Self { http: reqwest::Client::new(), signer, config, events: None }
    }

    pub fn with_event_sink(mut self, sink: impl Fn(PaymentEvent) + Send + Sync + 'static) -> Self {
        self.events = Some(Arc::new(sink));
        self
    }

    fn emit(&self, event: PaymentEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }

    /// Single fetch: intercepts a 402, settles, and retries (§4.5).
    pub async fn fetch(&self, request: ClientRequest) -> Result<reqwest::Response> {
        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);

        for attempt in 0..=self.config.max_retries {
            if Instant::now() > deadline {
                return Err(X402Error::Timeout);
            }

            let response = match request.build(&self.http).send().await {
                Ok(response) => response,
                Err(error) => {
                    if attempt == self.config.max_retries {
                        return Err(X402Error::from(error));
                    }
                    self.emit(PaymentEvent::Retrying { attempt });
                    sleep_backoff(attempt).await;
                    continue;
                }
            };

            if response.status().as_u16() != 402 {
                return Ok(response);
            }

            let challenge: PaymentRequiredBody = response
                .json()
                .await
                .map_err(|_| X402Error::invalid_challenge("402 body missing required fields"))?;

            self.emit(PaymentEvent::PaymentRequired {
                endpoint: challenge.payment.endpoint.clone(),
                amount_required: challenge.payment.amount_required.clone(),
            });

            if self.config.precheck_balance {
                let required = challenge
                    .payment
                    .amount()
                    .map_err(|_| X402Error::invalid_challenge("amountRequired is not a valid integer"))?;
                match self.signer.get_balance(challenge.payment.token_address).await {
                    Ok(balance) if balance < required => return Err(X402Error::InsufficientBalance),
                    Ok(_) => {}
                    Err(error) if attempt == self.config.max_retries => return Err(error),
                    Err(_) => {
                        self.emit(PaymentEvent::Retrying { attempt });
                        sleep_backoff(attempt).await;
                        continue;
                    }
                }
            }

            self.emit(PaymentEvent::PaymentSending);
            let amount = challenge
                .payment
                .amount()
                .map_err(|_| X402Error::invalid_challenge("amountRequired is not a valid integer"))?;
            let transfer = TransferRequest {
                token_contract: challenge.payment.token_address,
                recipient: challenge.payment.recipient_address,
                amount,
                memo: Some(challenge.payment.memo),
            };
            let tx_hash = match self.signer.submit_transfer(transfer).await {
                Ok(tx_hash) => tx_hash,
                Err(error) if attempt == self.config.max_retries => return Err(error),
                Err(_) => {
                    self.emit(PaymentEvent::Retrying { attempt });
                    sleep_backoff(attempt).await;
                    continue;
                }
            };
            self.emit(PaymentEvent::PaymentConfirmed { tx_hash });

            let header_value = format!("{:#x}:{}", tx_hash, challenge.payment.chain_id);
            let retried = request.clone().with_header("X-Payment", &header_value)?;
            return retried.build(&self.http).send().await.map_err(X402Error::from);
        }

        Err(X402Error::Exhausted)
    }

    /// Parallel fetch: fires all requests, settles the 402s concurrently,
    /// retries each with its own reference, preserving input-index order
    /// in the output (§4.5).
    pub async fn fetch_many(&self, requests: Vec<ClientRequest>) -> Vec<Result<reqwest::Response>> {
        if !self.signer.supports_concurrent_submission() {
            // Sequential fallback for ledgers that don't tolerate more than
            // one pending transaction per sender (§4.5, §9).
            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                results.push(self.fetch(request).await);
            }
            return results;
        }

        let initial = join_all(requests.iter().map(|r| r.build(&self.http).send())).await;

        let mut results: Vec<Option<Result<reqwest::Response>>> = Vec::with_capacity(requests.len());
        let mut pending_indices = Vec::new();

        for (index, response) in initial.into_iter().enumerate() {
            match response {
                Ok(response) if response.status().as_u16() != 402 => {
                    results.push(Some(Ok(response)));
                }
                Ok(response) => {
                    results.push(None);
                    pending_indices.push((index, response));
                }
                Err(error) => {
                    results.push(Some(Err(X402Error::from(error))));
                }
            }
        }

        let settlements = join_all(pending_indices.into_iter().map(|(index, response)| {
            let request = requests[index].clone();
            async move {
                let settled = self.settle_and_retry(&request, response).await;
                (index, settled)
            }
        }))
        .await;

        for (index, result) in settlements {
            results[index] = Some(result);
        }

        results.into_iter().map(|r| r.expect("every index resolved")).collect()
    }

    /// Batch fetch: one atomic multi-transfer transaction settles every
    /// pending request, which all retry with the same settlement header
    /// (§4.5). Falls back to [`Self::fetch_many`]'s per-request settlement
    /// when the signer doesn't support batching.
    pub async fn fetch_batch(&self, requests: Vec<ClientRequest>) -> Vec<Result<reqwest::Response>> {
        if !self.signer.supports_batch() {
            return self.fetch_many(requests).await;
        }

        let initial = join_all(requests.iter().map(|r| r.build(&self.http).send())).await;

        let mut results: Vec<Option<Result<reqwest::Response>>> = Vec::with_capacity(requests.len());
        let mut pending = Vec::new();

        for (index, response) in initial.into_iter().enumerate() {
            match response {
                Ok(response) if response.status().as_u16() != 402 => {
                    results.push(Some(Ok(response)));
                }
                Ok(response) => {
                    results.push(None);
                    pending.push((index, response));
                }
                Err(error) => {
                    results.push(Some(Err(X402Error::from(error))));
                }
            }
        }

        if pending.is_empty() {
            return results.into_iter().map(|r| r.expect("every index resolved")).collect();
        }

        let mut challenges = Vec::with_capacity(pending.len());
        for (index, response) in pending {
            match response.json::<PaymentRequiredBody>().await {
                Ok(challenge) => challenges.push((index, challenge)),
                Err(_) => {
                    results[index] =
                        Some(Err(X402Error::invalid_challenge("402 body missing required fields")));
                }
            }
        }
        if challenges.is_empty() {
            return results.into_iter().map(|r| r.expect("every index resolved")).collect();
        }

        let mut transfers = Vec::with_capacity(challenges.len());
        let mut settleable = Vec::with_capacity(challenges.len());
        for (index, challenge) in challenges {
            match challenge.payment.amount() {
                Ok(amount) => {
                    transfers.push(TransferRequest {
                        token_contract: challenge.payment.token_address,
                        recipient: challenge.payment.recipient_address,
                        amount,
                        memo: Some(challenge.payment.memo),
                    });
                    settleable.push((index, challenge));
                }
                Err(_) => {
                    results[index] = Some(Err(X402Error::invalid_challenge(
                        "amountRequired is not a valid integer",
                    )));
                }
            }
        }
        let challenges = settleable;
        if challenges.is_empty() {
            return results.into_iter().map(|r| r.expect("every index resolved")).collect();
        }

        let chain_id = challenges[0].1.payment.chain_id;
        self.emit(PaymentEvent::PaymentSending);

        let batch_tx_hash = match self.signer.submit_batch_transfer(transfers).await {
            Ok(tx_hash) => tx_hash,
            Err(error) => {
                for (index, _) in &challenges {
                    results[*index] = Some(Err(error_clone(&error)));
                }
                return results.into_iter().map(|r| r.expect("every index resolved")).collect();
            }
        };
        self.emit(PaymentEvent::PaymentConfirmed { tx_hash: batch_tx_hash });

        let header_value = format!("{:#x}:{}", batch_tx_hash, chain_id);
        let retries = join_all(challenges.into_iter().map(|(index, _)| {
            let request = requests[index].clone();
            let header_value = header_value.clone();
            async move {
                let result = match request.with_header("X-Payment", &header_value) {
                    Ok(retried) => retried.build(&self.http).send().await.map_err(X402Error::from),
                    Err(error) => Err(error),
                };
                (index, result)
            }
        }))
        .await;

        for (index, result) in retries {
            results[index] = Some(result);
        }

        results.into_iter().map(|r| r.expect("every index resolved")).collect()
    }

    async fn settle_and_retry(
        &self,
        request: &ClientRequest,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let challenge: PaymentRequiredBody = response
            .json()
            .await
            .map_err(|_| X402Error::invalid_challenge("402 body missing required fields"))?;

        self.emit(PaymentEvent::PaymentRequired {
            endpoint: challenge.payment.endpoint.clone(),
            amount_required: challenge.payment.amount_required.clone(),
        });

        if self.config.precheck_balance {
            let balance = self.signer.get_balance(challenge.payment.token_address).await?;
            let required = challenge
                .payment
                .amount()
                .map_err(|_| X402Error::invalid_challenge("amountRequired is not a valid integer"))?;
            if balance < required {
                return Err(X402Error::InsufficientBalance);
            }
        }

        self.emit(PaymentEvent::PaymentSending);
        let tx_hash = self
            .signer
            .submit_transfer(TransferRequest {
                token_contract: challenge.payment.token_address,
                recipient: challenge.payment.recipient_address,
                amount: challenge
                    .payment
                    .amount()
                    .map_err(|_| X402Error::invalid_challenge("amountRequired is not a valid integer"))?,
                memo: Some(challenge.payment.memo),
            })
            .await?;
        self.emit(PaymentEvent::PaymentConfirmed { tx_hash });

        let header_value = format!("{:#x}:{}", tx_hash, challenge.payment.chain_id);
        let retried = request.clone().with_header("X-Payment", &header_value)?;
        retried.build(&self.http).send().await.map_err(X402Error::from)
    }
}

fn error_clone(error: &X402Error) -> X402Error {
    X402Error::signer_failed(error.to_string())
}

async fn sleep_backoff(attempt: u32) {
    let millis = (1000u64.saturating_mul(1u64 << attempt.min(4))).min(10_000);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
