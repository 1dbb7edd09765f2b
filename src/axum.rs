//! Axum integration for the paywall middleware (§4.3's "axum is the one
//! reference integration; the protocol core itself is framework-agnostic").
//!
//! This is a thin adapter: all protocol logic lives in
//! [`crate::middleware::PaywallMiddleware`]; this module only translates
//! between Axum's request/response types and [`Decision`].

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use std::sync::Arc;

use crate::crypto::keccak256;
use crate::error::ErrorResponse;
use crate::middleware::{Decision, PaywallMiddleware};

/// Maximum request body buffered for the memo's body-hash component.
/// Bodies larger than this are hashed only up to the limit — acceptable
/// because the memo is a reconciliation aid, not a content-integrity
/// guarantee (§4.2 step 7 / §9).
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Mount the paywall as an Axum middleware layer plus the discovery
/// endpoint.
pub fn paywall_router(middleware: Arc<PaywallMiddleware>, protected: Router) -> Router {
    protected
        .layer(axum::middleware::from_fn_with_state(middleware.clone(), paywall_layer))
        .route("/.well-known/x-agentgate.json", axum::routing::get(discovery_handler))
        .with_state(middleware)
}

async fn discovery_handler(State(middleware): State<Arc<PaywallMiddleware>>) -> impl IntoResponse {
    Json(middleware.discovery())
}

async fn paywall_layer(
    State(middleware): State<Arc<PaywallMiddleware>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let header = request
        .headers()
        .get("X-Payment")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read request body").into_response(),
    };
    let body_hash = keccak256(&bytes);
    let request = Request::from_parts(parts, Body::from(bytes));

    let decision = middleware.handle(&method, &path, header.as_deref(), body_hash).await;

    match decision {
        Decision::Unpriced => next.run(request).await,
        Decision::ChallengeIssued(body) => challenge_response(&body),
        Decision::HeaderMalformed => {
            let error = ErrorResponse {
                error: "Invalid X-Payment header".to_string(),
                error_code: "INVALID_HEADER".to_string(),
                status_code: 400,
            };
            (StatusCode::BAD_REQUEST, Json(error)).into_response()
        }
        Decision::Replay => {
            let error = ErrorResponse {
                error: "settlement reference already used".to_string(),
                error_code: "REPLAY".to_string(),
                status_code: 409,
            };
            (StatusCode::CONFLICT, Json(error)).into_response()
        }
        Decision::Admitted(_observed) => next.run(request).await,
        Decision::Rejected(error) => {
            tracing::warn!(%error, "payment rejected");
            let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::PAYMENT_REQUIRED);
            let body = ErrorResponse::from(&error);
            (status, Json(body)).into_response()
        }
    }
}

fn challenge_response(body: &crate::types::PaymentRequiredBody) -> Response {
    let mut response = (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&body.payment.amount_required) {
        headers.insert("X-Payment-Amount", value);
    }
    if let Ok(value) = HeaderValue::from_str(&body.payment.token_symbol) {
        headers.insert("X-Payment-Token", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{:#x}", body.payment.recipient_address)) {
        headers.insert("X-Payment-Recipient", value);
    }
    response
}
