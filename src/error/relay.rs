use super::{IsRetryable, OauthError};
use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error as ThisError;

/// Request-level failures, rendered per the propagation policy: upstream
/// statuses forward verbatim, everything else maps onto a structured
/// envelope for the client's dialect.
#[derive(Debug, ThisError)]
pub enum RelayError {
    /// Malformed client request (translator rejection).
    #[error("translate error: {0}")]
    Translate(String),

    /// No live credential serves the requested model family.
    #[error("no available credential")]
    NoAvailableCredential,

    /// Every eligible (account, model) pair is ledger-exhausted.
    #[error("all models of '{model}' are quota exhausted")]
    AllExhausted { model: String },

    /// Upstream 429 for one account; pool-internal unless surfaced.
    #[error("upstream quota exhausted: {body:.200}")]
    Quota { body: String },

    /// Upstream 403 carrying an activation hint.
    #[error("upstream API disabled")]
    ApiDisabled {
        activation_url: Option<String>,
        body: String,
    },

    /// Non-2xx upstream response, forwarded verbatim.
    #[error("upstream status {status}: {body:.200}")]
    UpstreamStatus { status: StatusCode, body: String },

    /// Transport-level failure (DNS, connect, timeouts).
    #[error("HTTP request error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Token refresh failed; the credential is skipped.
    #[error(transparent)]
    Auth(#[from] OauthError),

    #[error("stream protocol error: {0}")]
    StreamProtocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Google-style error envelope: `{"error":{"code","message","status"}}`.
#[derive(Debug, Clone, Serialize)]
pub struct GoogleErrorObject {
    pub code: u16,
    pub message: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoogleErrorBody {
    #[serde(rename = "error")]
    pub inner: GoogleErrorObject,
}

impl GoogleErrorObject {
    pub fn new(code: StatusCode, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            message: message.into(),
            status: status.into(),
        }
    }

    pub fn into_body(self) -> GoogleErrorBody {
        GoogleErrorBody { inner: self }
    }
}

impl RelayError {
    /// Status plus the Google-envelope rendering, used by the Gemini-native
    /// surface and as the base for the other dialects.
    fn status_and_envelope(&self) -> (StatusCode, GoogleErrorBody) {
        match self {
            RelayError::Translate(msg) => (
                StatusCode::BAD_REQUEST,
                GoogleErrorObject::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", msg.clone())
                    .into_body(),
            ),
            RelayError::NoAvailableCredential => (
                StatusCode::SERVICE_UNAVAILABLE,
                GoogleErrorObject::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UNAVAILABLE",
                    "No available credentials to process the request.",
                )
                .into_body(),
            ),
            RelayError::AllExhausted { model } => (
                StatusCode::TOO_MANY_REQUESTS,
                GoogleErrorObject::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RESOURCE_EXHAUSTED",
                    format!("All the models of '{model}' are quota exhausted"),
                )
                .into_body(),
            ),
            RelayError::ApiDisabled { activation_url, .. } => {
                let message = match activation_url {
                    Some(url) => format!("API disabled. Activate it at: {url}"),
                    None => "API disabled for the bound project.".to_string(),
                };
                (
                    StatusCode::FORBIDDEN,
                    GoogleErrorObject::new(StatusCode::FORBIDDEN, "PERMISSION_DENIED", message)
                        .into_body(),
                )
            }
            RelayError::Auth(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                GoogleErrorObject::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UNAVAILABLE",
                    "Upstream authentication failed.",
                )
                .into_body(),
            ),
            RelayError::Transport(_) | RelayError::StreamProtocol(_) | RelayError::Json(_) => (
                StatusCode::BAD_GATEWAY,
                GoogleErrorObject::new(
                    StatusCode::BAD_GATEWAY,
                    "UNAVAILABLE",
                    "Upstream service error.",
                )
                .into_body(),
            ),
            RelayError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                GoogleErrorObject::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal server error occurred.",
                )
                .into_body(),
            ),
            // Verbatim-forward variants are handled before envelope
            // rendering; this arm is a safety net.
            RelayError::Quota { .. } | RelayError::UpstreamStatus { .. } => (
                StatusCode::BAD_GATEWAY,
                GoogleErrorObject::new(
                    StatusCode::BAD_GATEWAY,
                    "UNAVAILABLE",
                    "Upstream service error.",
                )
                .into_body(),
            ),
        }
    }

    /// The verbatim body-forward cases: same status, same bytes.
    fn verbatim(&self) -> Option<(StatusCode, String)> {
        match self {
            RelayError::Quota { body } => Some((StatusCode::TOO_MANY_REQUESTS, body.clone())),
            RelayError::UpstreamStatus { status, body } => Some((*status, body.clone())),
            _ => None,
        }
    }

    fn log(&self) {
        match self {
            RelayError::Translate(msg) => tracing::warn!(error = %msg, "client request rejected"),
            RelayError::Internal(msg) => tracing::error!(error = %msg, "internal relay error"),
            other => tracing::warn!(error = %other, "relay error"),
        }
    }
}

fn verbatim_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        self.log();
        if let Some((status, body)) = self.verbatim() {
            return verbatim_response(status, body);
        }
        let (status, body) = self.status_and_envelope();
        (status, Json(body)).into_response()
    }
}

/// OpenAI-dialect rendering of a relay error. Upstream statuses and the
/// pool-exhaustion envelope stay verbatim; local rejections use the OpenAI
/// error object.
pub struct OpenaiFacing(pub RelayError);

impl IntoResponse for OpenaiFacing {
    fn into_response(self) -> Response {
        self.0.log();
        if let Some((status, body)) = self.0.verbatim() {
            return verbatim_response(status, body);
        }
        if matches!(self.0, RelayError::AllExhausted { .. }) {
            let (status, body) = self.0.status_and_envelope();
            return (status, Json(body)).into_response();
        }
        let (status, envelope) = self.0.status_and_envelope();
        let kind = if status == StatusCode::BAD_REQUEST {
            "invalid_request_error"
        } else {
            "api_error"
        };
        (
            status,
            Json(json!({
                "error": {
                    "message": envelope.inner.message,
                    "type": kind,
                    "code": status.as_u16(),
                }
            })),
        )
            .into_response()
    }
}

/// Anthropic-dialect rendering of a relay error.
pub struct ClaudeFacing(pub RelayError);

impl IntoResponse for ClaudeFacing {
    fn into_response(self) -> Response {
        self.0.log();
        if let Some((status, body)) = self.0.verbatim() {
            return verbatim_response(status, body);
        }
        if matches!(self.0, RelayError::AllExhausted { .. }) {
            let (status, body) = self.0.status_and_envelope();
            return (status, Json(body)).into_response();
        }
        let (status, envelope) = self.0.status_and_envelope();
        let kind = if status == StatusCode::BAD_REQUEST {
            "invalid_request_error"
        } else {
            "api_error"
        };
        (
            status,
            Json(json!({
                "type": "error",
                "error": {
                    "type": kind,
                    "message": envelope.inner.message,
                }
            })),
        )
            .into_response()
    }
}

impl IsRetryable for RelayError {
    fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Transport(_))
    }
}
