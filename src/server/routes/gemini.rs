use crate::error::RelayError;
use crate::models::SUPPORTED_MODELS;
use crate::pool::UpstreamResponse;
use crate::relay::{GeminiSse, sse_relay};
use crate::server::router::CastorState;
use axum::{
    Json,
    extract::{ConnectInfo, Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use castor_schema::gemini::{GeminiModelList, GenerateContentRequest};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::LazyLock;
use tracing::{debug, warn};

static MODEL_LIST: LazyLock<GeminiModelList> =
    LazyLock::new(|| GeminiModelList::from_model_names(SUPPORTED_MODELS.iter().copied()));

pub async fn models_handler() -> Json<GeminiModelList> {
    Json(MODEL_LIST.clone())
}

/// `POST /v1beta/models/<model>:generateContent` and
/// `:streamGenerateContent` — native pass-through.
pub async fn generate_handler(
    State(state): State<CastorState>,
    Path(path): Path<String>,
    body: Result<Json<GenerateContentRequest>, JsonRejection>,
) -> Result<Response, RelayError> {
    let last_segment = path.rsplit('/').next().unwrap_or(path.as_str());
    let (model, op) = last_segment.split_once(':').ok_or_else(|| {
        RelayError::Translate(format!("missing operation in path: {last_segment}"))
    })?;

    let stream = match op {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(RelayError::Translate(format!(
                "unsupported operation: {other}"
            )));
        }
    };

    let Json(request) =
        body.map_err(|rejection| RelayError::Translate(rejection.body_text()))?;
    debug!(model, stream, turns = request.contents.len(), "native request accepted");

    let outcome = state.pool.dispatch(model, &request, stream).await?;
    match outcome {
        UpstreamResponse::Stream { response, provider } => {
            Ok(sse_relay(response, provider, Box::new(GeminiSse)).into_response())
        }
        UpstreamResponse::Json(response) => Ok(Json(response).into_response()),
    }
}

/// Code Assist passthrough (`loadCodeAssist`, `onboardUser`,
/// `countTokens`), relayed through an eligible OAuth credential. Accepted
/// only from loopback peers; the router mounts this without API-key
/// checks.
pub async fn internal_passthrough_handler(
    State(state): State<CastorState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    axum::extract::OriginalUri(uri): axum::extract::OriginalUri,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, RelayError> {
    if !peer.ip().is_loopback() {
        warn!(peer = %peer, "rejected non-loopback internal passthrough");
        return Err(RelayError::UpstreamStatus {
            status: StatusCode::FORBIDDEN,
            body: r#"{"error":{"code":403,"message":"internal operations are loopback-only","status":"PERMISSION_DENIED"}}"#
                .to_string(),
        });
    }

    let op = uri
        .path()
        .rsplit(':')
        .next()
        .ok_or_else(|| RelayError::Translate("missing operation".to_string()))?
        .to_string();

    let Json(payload) =
        body.map_err(|rejection| RelayError::Translate(rejection.body_text()))?;

    let client = state
        .pool
        .any_code_assist_client()
        .ok_or(RelayError::NoAvailableCredential)?;

    let result = client.code_assist_post(&op, &payload).await?;
    Ok(Json(result))
}
