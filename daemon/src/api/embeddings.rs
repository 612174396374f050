use axum::extract::State;
use axum::Json;
use kronk_api::{CancelToken, EmbedRequest, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: Value,
    pub input: Value,
}

#[derive(Serialize)]
pub struct EmbeddingsResponse {
    pub object: &'static str,
    pub data: Vec<EmbeddingObject>,
    pub model: String,
}

#[derive(Serialize)]
pub struct EmbeddingObject {
    pub object: &'static str,
    pub index: usize,
    pub embedding: Vec<f32>,
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmbeddingsRequest>,
) -> Result<Json<EmbeddingsResponse>, ApiError> {
    let model = match &request.model {
        Value::String(id) if !id.is_empty() => id.clone(),
        Value::String(_) => return Err(Error::invalid("model is required").into()),
        _ => return Err(Error::invalid("model must be a string").into()),
    };

    let inputs: Vec<String> = match &request.input {
        Value::String(text) => vec![text.clone()],
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::invalid("input must be a string or array of strings"))
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(Error::invalid("input must be a string or array of strings").into()),
    };

    let cancel = CancelToken::new();
    let mut data = Vec::with_capacity(inputs.len());

    for (index, text) in inputs.into_iter().enumerate() {
        let embedding = state
            .dispatcher
            .embed(&cancel, &model, EmbedRequest { text })
            .await?;

        data.push(EmbeddingObject {
            object: "embedding",
            index,
            embedding,
        });
    }

    Ok(Json(EmbeddingsResponse {
        object: "list",
        data,
        model,
    }))
}
