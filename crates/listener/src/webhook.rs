//! `POST /github`: GitHub webhook deliveries.
//!
//! The signature is checked against the raw body first. The payload is then
//! normalized synchronously so malformed deliveries get a 400, and the
//! dispatch itself runs in the background after the 202 is sent.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dispatch::DispatchError;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::signature::verify_signature;
use crate::AppState;

const HEADER_EVENT: &str = "x-github-event";
const HEADER_DELIVERY: &str = "x-github-delivery";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Reasons a delivery is refused.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::MissingHeader(HEADER_SIGNATURE) => StatusCode::UNAUTHORIZED,
            WebhookError::MissingHeader(_) | WebhookError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            WebhookError::Dispatch(DispatchError::MalformedPayload { .. }) => StatusCode::BAD_REQUEST,
            WebhookError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn get_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::MissingHeader(name))
}

/// Accepts one delivery and starts its dispatch.
///
/// - 202: accepted, body `{ "dispatch_id": "<uuid>" }`
/// - 400: missing `X-GitHub-Event`, invalid JSON or malformed payload
/// - 401: missing or invalid `X-Hub-Signature-256`
pub async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), WebhookError> {
    let delivery = headers
        .get(HEADER_DELIVERY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    let signature = get_header(&headers, HEADER_SIGNATURE)?;
    if !verify_signature(&body, signature, state.webhook_secret()) {
        warn!(delivery, "rejecting delivery with invalid signature");
        return Err(WebhookError::InvalidSignature);
    }

    let event = get_header(&headers, HEADER_EVENT)?;
    let payload: Value = serde_json::from_slice(&body)?;
    debug!(delivery, event, "webhook received");

    let ticket = state.dispatcher().submit_event(event, &payload).inspect_err(|error| {
        warn!(delivery, event, %error, "rejecting malformed delivery");
    })?;

    let dispatch_id = ticket.dispatch_id();
    let event = event.to_string();
    tokio::spawn(async move {
        match ticket.outcome().await {
            Ok(outcome) => info!(%dispatch_id, %event, ?outcome, "dispatch finished"),
            Err(error) => warn!(%dispatch_id, %event, %error, "dispatch failed"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "dispatch_id": dispatch_id }))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_signature_is_unauthorized() {
        let response = WebhookError::MissingHeader(HEADER_SIGNATURE).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn missing_event_header_is_a_bad_request() {
        let response = WebhookError::MissingHeader(HEADER_EVENT).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn malformed_payloads_are_bad_requests() {
        let error = WebhookError::from(DispatchError::malformed("push", "missing 'after'"));
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
