//! Model Record Routes

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use storage::{ModelRecord, NewModel, StorageError};
use tracing::info;

use crate::error::ApiError;
use crate::AppState;

/// Query parameters for the model list
#[derive(Debug, Deserialize)]
pub struct ModelQuery {
    /// Maximum number of records
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Response for the model list
#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub data: Vec<ModelRecord>,
    pub count: usize,
}

/// List registered models, newest first
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ModelQuery>,
) -> Result<Json<ModelListResponse>, ApiError> {
    let limit = params.limit.min(500);
    let data = state.models.list_models(limit).await?;

    Ok(Json(ModelListResponse {
        count: data.len(),
        data,
    }))
}

/// Register a model record
pub async fn create_model(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewModel>, JsonRejection>,
) -> Result<(StatusCode, Json<ModelRecord>), ApiError> {
    let Json(model) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    if model.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    if let Some(key) = &model.model_file {
        let plain = !key.is_empty() && !key.contains(['/', '\\']) && key != "." && key != "..";
        if !plain {
            return Err(ApiError::BadRequest(format!(
                "model_file '{}' must be a file stem, not a path",
                key
            )));
        }
    }

    let record = state.models.create_model(model).await?;
    info!(model_id = record.id, "Registered model '{}'", record.title);
    Ok((StatusCode::CREATED, Json(record)))
}

/// Model record detail
pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ModelRecord>, ApiError> {
    let record = state
        .models
        .get_model(id)
        .await
        .map_err(|e| lookup_error(id, e))?;
    Ok(Json(record))
}

/// A missing record is a 404; any other storage failure stays internal
pub(crate) fn lookup_error(id: i64, e: StorageError) -> ApiError {
    match e {
        StorageError::NotFound(_) => ApiError::NotFound(format!("Model {} not found", id)),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_mapping() {
        let missing = lookup_error(4, StorageError::NotFound("model 4".into()));
        assert!(matches!(missing, ApiError::NotFound(ref msg) if msg == "Model 4 not found"));

        let locked = lookup_error(4, StorageError::DatabaseError("database is locked".into()));
        assert!(matches!(locked, ApiError::Internal(_)));
    }
}
