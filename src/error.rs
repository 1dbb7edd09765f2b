//! Error types for the agentgate payment protocol

use thiserror::Error;

/// Result type alias for agentgate operations
pub type Result<T> = std::result::Result<T, X402Error>;

/// Main error type, covering both the server (paywall) and client
/// (settlement engine) sides of the protocol, per the §7 error taxonomy.
#[derive(Error, Debug)]
pub enum X402Error {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 402 challenge body was missing required fields or otherwise unusable
    #[error("invalid payment challenge: {message}")]
    InvalidChallenge { message: String },

    /// `X-Payment` header did not parse (`<txHash>:<chainId>`)
    #[error("invalid X-Payment header: {message}")]
    InvalidHeader { message: String },

    /// Settlement reference already claimed by a prior request
    #[error("settlement reference already used")]
    Replay,

    /// Payment requirement's expiry has passed
    #[error("payment requirement expired")]
    Expired,

    /// The on-chain transaction reverted
    #[error("transaction reverted on-chain")]
    TxReverted,

    /// No emitted log matched the requirement's token/recipient
    #[error("no matching transfer log found in receipt")]
    NoMatchingTransfer,

    /// Matching transfer found, but its value was below the required amount
    #[error("transferred amount below required amount")]
    Insufficient,

    /// A `TransferWithMemo` log matched recipient/token but its memo differed
    #[error("transfer memo does not match requirement")]
    MemoMismatch,

    /// The ledger RPC endpoint could not be reached, or its response could
    /// not be decoded
    #[error("ledger RPC unavailable: {reason}")]
    RpcUnavailable { reason: String },

    /// Client-side: balance precheck determined the payer cannot cover the
    /// requirement; not retried
    #[error("insufficient balance to settle payment")]
    InsufficientBalance,

    /// Client-side: the fetch deadline elapsed before a result was obtained
    #[error("payment settlement timed out")]
    Timeout,

    /// Client-side: the settlement retry budget was exhausted
    #[error("exhausted retry budget settling payment")]
    Exhausted,

    /// The signer could not complete a submit/resolve/balance operation
    #[error("signer failed: {message}")]
    SignerFailed { message: String },

    /// Invalid amount (non-positive, or more fractional digits than the
    /// token's decimals)
    #[error("invalid amount: {message}")]
    InvalidAmount { message: String },

    /// Configuration error raised at construction time
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Catch-all for conditions that should not arise in correct use
    #[error("unexpected error: {message}")]
    Unexpected { message: String },
}

impl X402Error {
    pub fn invalid_challenge(message: impl Into<String>) -> Self {
        Self::InvalidChallenge { message: message.into() }
    }

    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader { message: message.into() }
    }

    pub fn rpc_unavailable(reason: impl Into<String>) -> Self {
        Self::RpcUnavailable { reason: reason.into() }
    }

    pub fn signer_failed(message: impl Into<String>) -> Self {
        Self::SignerFailed { message: message.into() }
    }

    pub fn invalid_amount(message: impl Into<String>) -> Self {
        Self::InvalidAmount { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected { message: message.into() }
    }

    /// HTTP status code the server side should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidChallenge { .. } => 400,
            Self::InvalidHeader { .. } => 400,
            Self::Replay => 409,
            Self::Expired
            | Self::TxReverted
            | Self::NoMatchingTransfer
            | Self::Insufficient
            | Self::MemoMismatch
            | Self::RpcUnavailable { .. } => 402,
            Self::InsufficientBalance => 402,
            Self::Timeout => 408,
            Self::Exhausted => 402,
            Self::SignerFailed { .. } => 502,
            Self::InvalidAmount { .. } => 400,
            Self::Config { .. } => 500,
            Self::Unexpected { .. } => 500,
            Self::Json(_) => 400,
            Self::Http(_) => 502,
            Self::Io(_) => 500,
        }
    }

    /// Stable machine-readable error code, surfaced in 402 bodies so clients
    /// can branch without string-matching `error`.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidChallenge { .. } => "INVALID_CHALLENGE",
            Self::InvalidHeader { .. } => "INVALID_HEADER",
            Self::Replay => "REPLAY",
            Self::Expired => "PAYMENT_EXPIRED",
            Self::TxReverted => "TX_REVERTED",
            Self::NoMatchingTransfer => "NO_MATCH",
            Self::Insufficient => "INSUFFICIENT",
            Self::MemoMismatch => "MEMO_MISMATCH",
            Self::RpcUnavailable { .. } => "RPC_UNAVAILABLE",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::Timeout => "TIMEOUT",
            Self::Exhausted => "EXHAUSTED",
            Self::SignerFailed { .. } => "SIGNER_FAILED",
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Unexpected { .. } => "UNEXPECTED",
            Self::Json(_) => "JSON_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the client settlement engine should retry this error under
    /// the backoff schedule (§4.5, §7). `InsufficientBalance` and
    /// `InvalidChallenge` are the two non-retryable client-side errors.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InsufficientBalance | Self::InvalidChallenge { .. })
    }
}

/// Unified JSON error body for non-402 error responses.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(rename = "code")]
    pub error_code: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

impl From<&X402Error> for ErrorResponse {
    fn from(error: &X402Error) -> Self {
        Self {
            error: error.to_string(),
            error_code: error.error_code().to_string(),
            status_code: error.status_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_matches_spec() {
        assert!(!X402Error::InsufficientBalance.is_retryable());
        assert!(!X402Error::invalid_challenge("missing field").is_retryable());
        assert!(X402Error::rpc_unavailable("timeout").is_retryable());
        assert!(X402Error::Replay.is_retryable());
    }

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(X402Error::Replay.status_code(), 409);
        assert_eq!(X402Error::invalid_header("bad").status_code(), 400);
        assert_eq!(X402Error::Expired.status_code(), 402);
        assert_eq!(X402Error::NoMatchingTransfer.status_code(), 402);
    }
}
