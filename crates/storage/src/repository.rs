//! In-memory Repository

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::{
    ArtifactRef, JobId, JobStatus, JobStore, ModelRecord, ModelStore, NewJob, NewModel,
    PredictionJob, StorageError,
};

/// Repository for job and model records, kept in process memory
pub struct Repository {
    /// Jobs by ID
    jobs: Mutex<HashMap<JobId, PredictionJob>>,
    /// Models in insertion order
    models: Mutex<Vec<ModelRecord>>,
    /// Next job ID
    next_job_id: Mutex<JobId>,
    /// Next model ID
    next_model_id: Mutex<i64>,
}

impl Repository {
    /// Create a new in-memory repository
    pub fn new() -> Self {
        info!("Creating in-memory repository");
        Self {
            jobs: Mutex::new(HashMap::with_capacity(256)),
            models: Mutex::new(Vec::new()),
            next_job_id: Mutex::new(1),
            next_model_id: Mutex::new(1),
        }
    }

    fn next_id(counter: &Mutex<i64>) -> Result<i64, StorageError> {
        let mut id = counter
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;
        let current = *id;
        *id += 1;
        Ok(current)
    }

    fn finish_job(
        &self,
        id: JobId,
        status: JobStatus,
        output_image: Option<String>,
        error: Option<String>,
    ) -> Result<PredictionJob, StorageError> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;

        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("job {}", id)))?;
        job.finish(status, output_image, error)?;
        debug!("Job {} -> {}", id, status);
        Ok(job.clone())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.clear();
        }
        if let Ok(mut models) = self.models.lock() {
            models.clear();
        }
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for Repository {
    async fn create_job(&self, job: NewJob) -> Result<PredictionJob, StorageError> {
        let id = Self::next_id(&self.next_job_id)?;
        let now = Utc::now();
        let record = PredictionJob {
            id,
            model_id: job.model_id,
            model_key: job.model_key,
            input_name: job.input.name,
            input_image: job.input.url,
            output_image: None,
            status: JobStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;
        jobs.insert(id, record.clone());
        debug!("Inserted job with ID {}", id);

        Ok(record)
    }

    async fn get_job(&self, id: JobId) -> Result<PredictionJob, StorageError> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;

        jobs.get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job {}", id)))
    }

    async fn complete_job(
        &self,
        id: JobId,
        output: &ArtifactRef,
    ) -> Result<PredictionJob, StorageError> {
        self.finish_job(id, JobStatus::Done, Some(output.url.clone()), None)
    }

    async fn fail_job(&self, id: JobId, message: &str) -> Result<PredictionJob, StorageError> {
        self.finish_job(id, JobStatus::Error, None, Some(message.to_string()))
    }

    async fn job_count(&self) -> Result<usize, StorageError> {
        self.jobs
            .lock()
            .map(|j| j.len())
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))
    }

    async fn pending_jobs(&self) -> Result<Vec<JobId>, StorageError> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;

        let mut pending: Vec<JobId> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect();
        pending.sort_unstable();
        Ok(pending)
    }
}

#[async_trait]
impl ModelStore for Repository {
    async fn create_model(&self, model: NewModel) -> Result<ModelRecord, StorageError> {
        let id = Self::next_id(&self.next_model_id)?;
        let record = ModelRecord {
            id,
            title: model.title,
            description: model.description,
            instructions: model.instructions,
            image: model.image,
            author: model.author,
            date: model.date,
            category: model.category,
            model_file: model.model_file,
            created_at: Utc::now(),
        };

        let mut models = self
            .models
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;
        models.push(record.clone());
        debug!("Inserted model with ID {}", id);

        Ok(record)
    }

    async fn get_model(&self, id: i64) -> Result<ModelRecord, StorageError> {
        let models = self
            .models
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;

        models
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("model {}", id)))
    }

    async fn list_models(&self, limit: usize) -> Result<Vec<ModelRecord>, StorageError> {
        let models = self
            .models
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;

        Ok(models.iter().rev().take(limit).cloned().collect())
    }

    async fn model_count(&self) -> Result<usize, StorageError> {
        self.models
            .lock()
            .map(|m| m.len())
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> NewJob {
        NewJob {
            model_id: 1,
            model_key: "nitride".to_string(),
            input: ArtifactRef {
                name: "sample.png".to_string(),
                url: "https://localhost/media/sample.png".to_string(),
            },
        }
    }

    fn output() -> ArtifactRef {
        ArtifactRef {
            name: "output_image_enhanced_1.png".to_string(),
            url: "https://localhost/media/output_image_enhanced_1.png".to_string(),
        }
    }

    #[tokio::test]
    async fn test_job_insert_and_retrieve() {
        let repo = Repository::new();

        let job = repo.create_job(new_job()).await.unwrap();
        assert_eq!(job.id, 1);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.output_image.is_none());

        let fetched = repo.get_job(job.id).await.unwrap();
        assert_eq!(fetched.input_image, "https://localhost/media/sample.png");
        assert_eq!(repo.job_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_job_ids_increase() {
        let repo = Repository::new();
        let a = repo.create_job(new_job()).await.unwrap();
        let b = repo.create_job(new_job()).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_complete_job_records_output() {
        let repo = Repository::new();
        let job = repo.create_job(new_job()).await.unwrap();

        let done = repo.complete_job(job.id, &output()).await.unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.output_image.as_deref(), Some(output().url.as_str()));
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let repo = Repository::new();
        let job = repo.create_job(new_job()).await.unwrap();
        repo.fail_job(job.id, "decode failed").await.unwrap();

        let result = repo.complete_job(job.id, &output()).await;
        assert!(matches!(
            result,
            Err(StorageError::InvalidTransition {
                status: JobStatus::Error,
                ..
            })
        ));

        let stored = repo.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("decode failed"));
        assert!(stored.output_image.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let repo = Repository::new();
        assert!(matches!(repo.get_job(99).await, Err(StorageError::NotFound(_))));
        assert!(matches!(
            repo.fail_job(99, "x").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_models_newest_first() {
        let repo = Repository::new();
        for title in ["first", "second", "third"] {
            repo.create_model(NewModel {
                title: title.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let listed = repo.list_models(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "third");
        assert_eq!(listed[1].title, "second");
        assert_eq!(repo.get_model(1).await.unwrap().title, "first");
        assert_eq!(repo.model_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_pending_jobs() {
        let repo = Repository::new();
        let a = repo.create_job(new_job()).await.unwrap();
        let b = repo.create_job(new_job()).await.unwrap();
        let c = repo.create_job(new_job()).await.unwrap();
        repo.complete_job(b.id, &output()).await.unwrap();

        assert_eq!(repo.pending_jobs().await.unwrap(), vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn test_clear() {
        let repo = Repository::new();
        repo.create_job(new_job()).await.unwrap();
        repo.clear();
        assert_eq!(repo.job_count().await.unwrap(), 0);
    }
}
