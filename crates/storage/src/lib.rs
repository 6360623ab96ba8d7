//! Storage Layer
//!
//! - Job and model records behind the [`JobStore`] / [`ModelStore`] traits,
//!   with an in-memory [`Repository`] and a SQLite-backed [`SqliteRepository`]
//! - Artifact files behind [`ArtifactStore`], served from a public media URL

mod artifacts;
mod models;
mod repository;
mod sqlite;

pub use artifacts::{ArtifactRef, ArtifactStore, FsArtifactStore, MediaConfig, UrlScheme};
pub use models::{JobId, JobStatus, ModelRecord, NewJob, NewModel, PredictionJob};
pub use repository::Repository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Storage failure: {0}")]
    StorageFailure(String),
    #[error("Job {id} is already {status}")]
    InvalidTransition { id: JobId, status: JobStatus },
}

/// Persistence for prediction jobs
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `pending`
    async fn create_job(&self, job: NewJob) -> Result<PredictionJob, StorageError>;

    async fn get_job(&self, id: JobId) -> Result<PredictionJob, StorageError>;

    /// Move a pending job to `done` with its output artifact
    async fn complete_job(
        &self,
        id: JobId,
        output: &ArtifactRef,
    ) -> Result<PredictionJob, StorageError>;

    /// Move a pending job to `error` with a diagnostic message
    async fn fail_job(&self, id: JobId, message: &str) -> Result<PredictionJob, StorageError>;

    async fn job_count(&self) -> Result<usize, StorageError>;

    /// Ids of jobs still `pending`, oldest first
    async fn pending_jobs(&self) -> Result<Vec<JobId>, StorageError>;
}

/// Persistence for registered models
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn create_model(&self, model: NewModel) -> Result<ModelRecord, StorageError>;

    async fn get_model(&self, id: i64) -> Result<ModelRecord, StorageError>;

    /// Newest first
    async fn list_models(&self, limit: usize) -> Result<Vec<ModelRecord>, StorageError>;

    async fn model_count(&self) -> Result<usize, StorageError>;
}
