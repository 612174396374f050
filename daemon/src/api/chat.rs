use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::Stream;
use kronk_api::{CancelToken, ChatResponse, Usage, OBJECT_CHAT};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;

use super::ApiError;
use crate::state::AppState;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    let stream = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if stream {
        chat_stream(state, body).await.into_response()
    } else {
        chat_non_stream(state, body).await.into_response()
    }
}

async fn chat_non_stream(
    state: Arc<AppState>,
    body: Value,
) -> Result<Json<ChatResponse>, ApiError> {
    let cancel = CancelToken::new();

    let mut rx = state.dispatcher.completions_stream(&cancel, &body).await?;

    let mut last = None;
    while let Some(response) = rx.recv().await {
        last = Some(response);
    }

    match last {
        Some(response) => Ok(Json(response)),
        None => Err(kronk_api::Error::internal("stream ended without a response").into()),
    }
}

async fn chat_stream(
    state: Arc<AppState>,
    body: Value,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cancel = CancelToken::new();

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let stream = async_stream::stream! {
        // Dropped when the client goes away, cancelling the decoder.
        let _disconnect = CancelOnDrop(cancel.clone());

        match state.dispatcher.completions_stream(&cancel, &body).await {
            Ok(mut rx) => {
                while let Some(response) = rx.recv().await {
                    yield Ok(Event::default().data(serde_json::to_string(&response).unwrap_or_default()));
                }
            }
            Err(err) => {
                // Errors before the first emission surface as a
                // single-response stream.
                let id = uuid_like_id();
                let response = ChatResponse::error(&id, OBJECT_CHAT, &model, 0, &err, Usage::default());
                yield Ok(Event::default().data(serde_json::to_string(&response).unwrap_or_default()));
            }
        }
    };

    Sse::new(stream)
}

struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel("client disconnected");
    }
}

fn uuid_like_id() -> String {
    format!("{:x}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
}
