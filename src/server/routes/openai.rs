use crate::error::{OpenaiFacing, RelayError};
use crate::models::SUPPORTED_MODELS;
use crate::pool::UpstreamResponse;
use crate::relay::{OpenaiSse, sse_relay};
use crate::server::router::CastorState;
use crate::translate::openai::{include_reasoning, request_to_gemini, response_from_gemini};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::{IntoResponse, Response},
};
use castor_schema::openai::{ChatCompletionRequest, OpenaiModelList};
use std::sync::LazyLock;
use tracing::debug;

static MODEL_LIST: LazyLock<OpenaiModelList> = LazyLock::new(|| {
    OpenaiModelList::from_model_names(SUPPORTED_MODELS.iter().copied(), "castor".to_string())
});

pub async fn models_handler() -> Json<OpenaiModelList> {
    Json(MODEL_LIST.clone())
}

pub async fn chat_completions_handler(
    State(state): State<CastorState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, OpenaiFacing> {
    let Json(request) = body
        .map_err(|rejection| OpenaiFacing(RelayError::Translate(rejection.body_text())))?;

    let gemini = request_to_gemini(&request).map_err(OpenaiFacing)?;
    let with_reasoning = include_reasoning(&request);
    debug!(
        model = %request.model,
        stream = request.stream,
        turns = gemini.contents.len(),
        "chat completion accepted"
    );

    let outcome = state
        .pool
        .dispatch(&request.model, &gemini, request.stream)
        .await
        .map_err(OpenaiFacing)?;

    match outcome {
        UpstreamResponse::Stream { response, provider } => Ok(sse_relay(
            response,
            provider,
            Box::new(OpenaiSse::new(&request.model, with_reasoning)),
        )
        .into_response()),
        UpstreamResponse::Json(response) => Ok(Json(response_from_gemini(
            &request.model,
            with_reasoning,
            &response,
        ))
        .into_response()),
    }
}
