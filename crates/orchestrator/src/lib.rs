//! Prediction Job Orchestration
//!
//! Runs the tiled segmentation pipeline (patches, per-patch inference,
//! stitching, enhancement, rendering) off the request path and tracks each
//! job through `pending` to exactly one of `done` or `error`.

mod orchestrator;
mod pipeline;

pub use orchestrator::{JobOrchestrator, JobStatusView, WorkerConfig, WorkerPool};
pub use pipeline::{Pipeline, PipelineConfig};

use inference_engine::InferenceError;
use postprocess::RenderError;
use storage::{JobId, JobStatus, StorageError};
use thiserror::Error;
use tiling::TilingError;

/// Failures inside one pipeline execution; recorded as the job's error
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Tiling failed: {0}")]
    Tiling(#[from] TilingError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),
    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),
}

/// Job lifecycle errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Prediction job {0} not found")]
    JobNotFound(JobId),
    #[error("Prediction job {0} is already running")]
    AlreadyRunning(JobId),
    #[error("Prediction job {id} is not pending (status: {status})")]
    NotPending { id: JobId, status: JobStatus },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Internal error: {0}")]
    Internal(String),
}
