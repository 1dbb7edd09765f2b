//! Error taxonomy tests: status codes, error codes, and retryability (§7).

use agentgate::X402Error;

#[test]
fn invalid_header_is_a_400_and_not_retryable_by_the_server() {
    let error = X402Error::invalid_header("missing colon separator");
    assert_eq!(error.status_code(), 400);
    assert_eq!(error.error_code(), "INVALID_HEADER");
    assert!(error.to_string().contains("missing colon separator"));
}

#[test]
fn replay_is_a_409() {
    let error = X402Error::Replay;
    assert_eq!(error.status_code(), 409);
    assert_eq!(error.error_code(), "REPLAY");
}

#[test]
fn ledger_rejection_reasons_map_to_402() {
    for error in [
        X402Error::Expired,
        X402Error::TxReverted,
        X402Error::NoMatchingTransfer,
        X402Error::Insufficient,
        X402Error::MemoMismatch,
    ] {
        assert_eq!(error.status_code(), 402, "{error} should be a 402");
    }
}

#[test]
fn rpc_unavailable_is_retryable_but_insufficient_balance_is_not() {
    assert!(X402Error::rpc_unavailable("connection reset").is_retryable());
    assert!(!X402Error::InsufficientBalance.is_retryable());
}

#[test]
fn invalid_challenge_is_not_retryable() {
    // A malformed 402 body won't parse any differently on retry, so the
    // client settlement engine must not spend its retry budget on it (§4.5).
    assert!(!X402Error::invalid_challenge("missing payment field").is_retryable());
}

#[test]
fn signer_failures_surface_as_a_502() {
    let error = X402Error::signer_failed("custody API returned 503");
    assert_eq!(error.status_code(), 502);
    assert_eq!(error.error_code(), "SIGNER_FAILED");
}

#[test]
fn invalid_amount_is_a_400() {
    let error = X402Error::invalid_amount("amount has more than 6 fractional digits");
    assert_eq!(error.status_code(), 400);
}

#[test]
fn error_response_mirrors_the_error_it_was_built_from() {
    let error = X402Error::Replay;
    let response = agentgate::error::ErrorResponse::from(&error);
    assert_eq!(response.status_code, 409);
    assert_eq!(response.error_code, "REPLAY");
    assert_eq!(response.error, error.to_string());
}
