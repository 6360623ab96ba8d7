//! Prediction Routes

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use orchestrator::JobStatusView;
use serde::{Deserialize, Serialize};
use storage::JobId;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::models;
use crate::AppState;

/// Multipart field carrying the image
const IMAGE_FIELD: &str = "image";

/// Response for an accepted prediction
#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub message: String,
    pub prediccion_id: JobId,
    pub input_image_url: String,
}

/// Store the uploaded image and queue a prediction job
pub async fn trigger_prediction(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<i64>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let record = state
        .models
        .get_model(model_id)
        .await
        .map_err(|e| models::lookup_error(model_id, e))?;
    let model_key = record.model_file.ok_or_else(|| {
        ApiError::NotFound(format!("Model {} has no model file", model_id))
    })?;
    state.orchestrator.pipeline().cache().ensure_exists(&model_key)?;

    let mut multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let extension = field.file_name().and_then(upload_extension);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        if !data.is_empty() {
            upload = Some((extension, data));
            break;
        }
    }
    let (extension, data) = upload.ok_or(ApiError::UploadMissing)?;

    let name = format!(
        "input_{}.{}",
        Uuid::new_v4().simple(),
        extension.unwrap_or_else(|| "img".to_string())
    );
    let size = data.len();
    let artifacts = Arc::clone(&state.artifacts);
    let input = tokio::task::spawn_blocking(move || artifacts.put(&name, &data))
        .await
        .map_err(|e| ApiError::Internal(format!("upload task failed: {}", e)))??;
    debug!(model_id, "Stored upload as {}", input.name);
    record_upload(size);

    let input_image_url = input.url.clone();
    let job_id = state.orchestrator.create(model_id, &model_key, input).await?;
    info!(job_id, model_id, "Prediction accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            message: "Prediction started".to_string(),
            prediccion_id: job_id,
            input_image_url,
        }),
    ))
}

/// Poll a prediction job
pub async fn get_prediction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobStatusView>, ApiError> {
    Ok(Json(state.orchestrator.get_status(id).await?))
}

fn record_upload(bytes: usize) {
    metrics::counter!("segserve_uploads_total").increment(1);
    metrics::histogram!("segserve_upload_bytes").record(bytes as f64);
}

/// Lower-cased extension of an uploaded file name, if it is a short alphanumeric one
fn upload_extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_upload_metrics_recorded() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_upload(2048);
            record_upload(512);
        });

        let rendered = handle.render();
        assert!(rendered.contains("segserve_uploads_total 2"));
        assert!(rendered.contains("segserve_upload_bytes"));
    }

    #[test]
    fn test_upload_extension() {
        assert_eq!(upload_extension("scan.PNG").as_deref(), Some("png"));
        assert_eq!(upload_extension("a.b.jpeg").as_deref(), Some("jpeg"));
        assert_eq!(upload_extension("noext"), None);
        assert_eq!(upload_extension("evil./../x"), None);
        assert_eq!(upload_extension("trailing."), None);
    }
}
