//! `POST /register` and `DELETE /register`: the registration API.
//!
//! Both require `Authorization: Token <api token>`. Submitted records are
//! validated before they reach the store; records already stored are never
//! re-validated.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dispatch::{Registration, RegistrationError, RegistrationIdentity, StoreError};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use crate::AppState;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("missing or invalid API token")]
    Unauthorized,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] RegistrationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for RegisterError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegisterError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegisterError::InvalidJson(_) | RegisterError::Invalid(_) => StatusCode::BAD_REQUEST,
            RegisterError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Compares fixed-size digests so neither content nor length of the
/// configured token shows in timing.
fn token_matches(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    bool::from(presented.as_slice().ct_eq(expected.as_slice()))
}

fn authorize(headers: &HeaderMap, api_token: &str) -> Result<(), RegisterError> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Token "))
        .ok_or(RegisterError::Unauthorized)?;
    if api_token.is_empty() || !token_matches(presented.trim(), api_token) {
        return Err(RegisterError::Unauthorized);
    }
    Ok(())
}

/// Stores a registration, replacing any record with the same identity.
pub async fn register_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, RegisterError> {
    authorize(&headers, state.api_token())?;
    let registration: Registration = serde_json::from_slice(&body)?;
    registration.validate().inspect_err(|error| {
        warn!(%error, job = %registration.job_name, "registration refused");
    })?;

    let identity = registration.identity();
    state.registrations().upsert(registration).await?;
    info!(
        kind = %identity.event_kind,
        repository = %identity.repository,
        job = %identity.job_name,
        "registration accepted"
    );
    Ok(Json(json!({ "registered": identity })))
}

/// Deletes the registration with the given identity.
pub async fn unregister_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, RegisterError> {
    authorize(&headers, state.api_token())?;
    let identity: RegistrationIdentity = serde_json::from_slice(&body)?;
    let removed = state.registrations().remove(&identity).await?;
    Ok(Json(json!({ "removed": removed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn token_scheme_is_required() {
        assert!(authorize(&headers("Token s3cret"), "s3cret").is_ok());
        assert!(authorize(&headers("Bearer s3cret"), "s3cret").is_err());
        assert!(authorize(&headers("Token wrong"), "s3cret").is_err());
        assert!(authorize(&HeaderMap::new(), "s3cret").is_err());
    }

    #[test]
    fn an_empty_configured_token_admits_nobody() {
        assert!(authorize(&headers("Token "), "").is_err());
    }

    #[test]
    fn tokens_of_another_length_are_refused() {
        assert!(authorize(&headers("Token s3cre"), "s3cret").is_err());
        assert!(authorize(&headers("Token s3cret-and-more"), "s3cret").is_err());
    }

    #[test]
    fn tokens_of_the_same_length_must_match_exactly() {
        assert!(authorize(&headers("Token s3creT"), "s3cret").is_err());
        assert!(authorize(&headers("Token S3cret"), "s3cret").is_err());
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cret", "s3creu"));
    }
}
