use crate::auth::CredentialStore;
use crate::pool::AccountPool;
use crate::server::guards::auth::RequireKeyAuth;
use crate::server::routes::{claude, gemini, openai};
use axum::{
    Router,
    extract::Request,
    http::{HeaderName, HeaderValue, StatusCode, header::USER_AGENT},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use base64::Engine as _;
use rand::RngCore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const MAX_REQUEST_ID_LEN: usize = 128;
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub struct CastorState {
    pub pool: Arc<AccountPool>,
    pub store: Arc<CredentialStore>,
    pub api_keys: Arc<Vec<String>>,
}

impl CastorState {
    pub fn new(pool: Arc<AccountPool>, store: Arc<CredentialStore>, api_keys: Vec<String>) -> Self {
        CastorState {
            pool,
            store,
            api_keys: Arc::new(api_keys),
        }
    }
}

fn generate_request_id() -> String {
    // 96 bits => 16 chars base64url (no padding).
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let request_id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let mut resp = next.run(req).await;

    // Always reflect `x-request-id` for correlation, even if the client
    // didn't send one.
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }

    let status = resp.status();
    // For SSE responses this is time-to-first-byte, not stream duration.
    let latency_ms = start.elapsed().as_millis() as u64;
    let path = uri.path();

    if status.is_server_error() {
        error!(
            "| {:>3} | {} | {:^7} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            path,
            latency_ms,
            user_agent
        );
    } else if status.is_client_error() {
        warn!(
            "| {:>3} | {} | {:^7} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            path,
            latency_ms,
            user_agent
        );
    } else {
        info!(
            "| {:>3} | {} | {:^7} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            path,
            latency_ms,
            user_agent
        );
    }

    resp
}

pub fn castor_router(state: CastorState) -> Router {
    let keyed = Router::new()
        .route("/v1/models", get(openai::models_handler))
        .route("/v1/chat/completions", post(openai::chat_completions_handler))
        .route("/v1/messages", post(claude::messages_handler))
        .route("/v1beta/models", get(gemini::models_handler))
        .route("/v1beta/models/{*path}", post(gemini::generate_handler))
        .layer(middleware::from_extractor_with_state::<RequireKeyAuth, _>(
            state.clone(),
        ));

    // Code Assist passthrough: loopback peers only, no API-key check.
    let internal = Router::new()
        .route(
            "/v1internal:loadCodeAssist",
            post(gemini::internal_passthrough_handler),
        )
        .route(
            "/v1internal:onboardUser",
            post(gemini::internal_passthrough_handler),
        )
        .route(
            "/v1internal:countTokens",
            post(gemini::internal_passthrough_handler),
        );

    Router::new()
        .merge(keyed)
        .merge(internal)
        .fallback(not_found_handler)
        .with_state(state)
        .layer(middleware::from_fn(access_log))
}
