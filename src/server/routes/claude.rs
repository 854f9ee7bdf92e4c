use crate::error::{ClaudeFacing, RelayError};
use crate::pool::UpstreamResponse;
use crate::relay::{ClaudeSse, sse_relay};
use crate::server::router::CastorState;
use crate::translate::claude::{request_to_gemini, response_from_gemini};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::{IntoResponse, Response},
};
use castor_schema::claude::MessagesRequest;
use tracing::debug;

pub async fn messages_handler(
    State(state): State<CastorState>,
    body: Result<Json<MessagesRequest>, JsonRejection>,
) -> Result<Response, ClaudeFacing> {
    let Json(request) =
        body.map_err(|rejection| ClaudeFacing(RelayError::Translate(rejection.body_text())))?;

    let gemini = request_to_gemini(&request).map_err(ClaudeFacing)?;
    debug!(
        model = %request.model,
        stream = request.stream,
        turns = gemini.contents.len(),
        "messages request accepted"
    );

    let outcome = state
        .pool
        .dispatch(&request.model, &gemini, request.stream)
        .await
        .map_err(ClaudeFacing)?;

    match outcome {
        UpstreamResponse::Stream { response, provider } => Ok(sse_relay(
            response,
            provider,
            Box::new(ClaudeSse::new(&request.model)),
        )
        .into_response()),
        UpstreamResponse::Json(response) => {
            Ok(Json(response_from_gemini(&request.model, &response)).into_response())
        }
    }
}
