use crate::server::router::CastorState;
use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use serde_json::json;
use subtle::ConstantTimeEq;

fn extract_bearer(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

/// Client API-key check over the configured key list, constant-time per
/// comparison. An empty list disables the check.
#[derive(Debug, Clone, Copy)]
pub struct RequireKeyAuth;

impl FromRequestParts<CastorState> for RequireKeyAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &CastorState,
    ) -> Result<Self, Self::Rejection> {
        if state.api_keys.is_empty() {
            return Ok(RequireKeyAuth);
        }

        let Some(presented) = extract_bearer(&parts.headers) else {
            return Err(AuthError::MissingKey);
        };

        let authorized = state
            .api_keys
            .iter()
            .any(|key| presented.as_bytes().ct_eq(key.as_bytes()).into());
        if authorized {
            Ok(RequireKeyAuth)
        } else {
            Err(AuthError::InvalidKey)
        }
    }
}

pub enum AuthError {
    MissingKey,
    InvalidKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let reason = match self {
            AuthError::MissingKey => "Missing API key",
            AuthError::InvalidKey => "Invalid API key",
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized", "reason": reason })),
        )
            .into_response()
    }
}
