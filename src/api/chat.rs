use std::convert::Infallible;

use axum::Extension;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;

use crate::AppState;
use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::gateway::GatewayResponse;
use crate::providers::types::ChatRequest;

/// POST /v1/chat/completions
///
/// Buffered requests answer with a `chat.completion` body. Streaming requests
/// answer with `chat.completion.chunk` events, a final chunk carrying usage,
/// and `data: [DONE]`; a failed stream ends with an error event instead.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let request_id = request_id(&headers);

    match state.gateway.complete(&identity, request, &request_id).await? {
        GatewayResponse::Json(response) => Ok(Json(response).into_response()),
        GatewayResponse::Stream(transcoder) => {
            let events =
                transcoder.map(|frame| Ok::<_, Infallible>(Event::default().data(frame.data())));
            Ok(Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response())
        }
    }
}

/// The id set by the request-id layer, or a fresh one when the handler is
/// mounted without it.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
