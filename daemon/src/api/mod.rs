pub mod chat;
pub mod embeddings;
pub mod models;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::state::AppState;
use std::sync::Arc;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/debug/vars", get(debug_vars))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/{model}", get(models::show_model))
        .route("/v1/models/{model}", delete(models::delete_model))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/embeddings", post(embeddings::embeddings))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn debug_vars(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    Json(state.dispatcher.metrics_snapshot())
}

/// Maps domain errors onto HTTP statuses.
pub struct ApiError(pub kronk_api::Error);

impl From<kronk_api::Error> for ApiError {
    fn from(err: kronk_api::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use kronk_api::Error;

        let status = match &self.0 {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Busy { .. } => StatusCode::CONFLICT,
            Error::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.0.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
