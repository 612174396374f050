use axum::extract::{Path, State};
use axum::Json;
use kronk_engine::ModelInfo;
use serde::Serialize;
use std::sync::Arc;

use super::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
    pub loaded: bool,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ModelsResponse>, ApiError> {
    let models = state
        .dispatcher
        .list()
        .await?
        .into_iter()
        .map(|m| ModelObject {
            id: m.id,
            object: "model",
            owned_by: "kronk",
            loaded: m.loaded,
        })
        .collect();

    Ok(Json(ModelsResponse {
        object: "list",
        data: models,
    }))
}

pub async fn show_model(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<ModelInfo>, ApiError> {
    Ok(Json(state.dispatcher.model_info(&model).await?))
}

pub async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.dispatcher.unload(&model, None).await?;

    Ok(Json(serde_json::json!({
        "id": model,
        "object": "model",
        "deleted": true,
    })))
}
