//! Job Orchestrator

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use storage::{ArtifactRef, JobId, JobStatus, JobStore, NewJob, PredictionJob, StorageError};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pipeline::Pipeline;
use crate::OrchestratorError;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pipelines allowed to run at the same time
    pub max_concurrent_jobs: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
        }
    }
}

/// Read-only view returned to pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub input_image: String,
    pub output_image: Option<String>,
    pub error: Option<String>,
}

impl From<PredictionJob> for JobStatusView {
    fn from(job: PredictionJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            input_image: job.input_image,
            output_image: job.output_image,
            error: job.error,
        }
    }
}

/// Creates prediction jobs and drives each to a single terminal status
pub struct JobOrchestrator {
    jobs: Arc<dyn JobStore>,
    pipeline: Arc<Pipeline>,
    queue: mpsc::UnboundedSender<JobId>,
    /// Job ids currently being run by this process
    claimed: Mutex<HashSet<JobId>>,
}

/// Releases a claimed job id when the run ends
struct Claim<'a> {
    claimed: &'a Mutex<HashSet<JobId>>,
    id: JobId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.remove(&self.id);
        }
    }
}

impl JobOrchestrator {
    /// Create the orchestrator and the worker pool that drains its queue
    ///
    /// Jobs stay pending until [`WorkerPool::spawn`] is called.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        pipeline: Arc<Pipeline>,
        config: &WorkerConfig,
    ) -> (Arc<Self>, WorkerPool) {
        let (queue, receiver) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            jobs,
            pipeline,
            queue,
            claimed: Mutex::new(HashSet::new()),
        });
        let pool = WorkerPool::new(Arc::clone(&orchestrator), receiver, config);
        (orchestrator, pool)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Persist a pending job for an uploaded input and queue it
    pub async fn create(
        &self,
        model_id: i64,
        model_key: &str,
        input: ArtifactRef,
    ) -> Result<JobId, OrchestratorError> {
        let job = self
            .jobs
            .create_job(NewJob {
                model_id,
                model_key: model_key.to_string(),
                input,
            })
            .await?;
        metrics::counter!("segserve_jobs_created_total").increment(1);
        info!(job_id = job.id, model_key, "Created prediction job");

        if self.queue.send(job.id).is_err() {
            warn!(job_id = job.id, "Worker pool is not running; job stays pending");
        }
        Ok(job.id)
    }

    /// Queue every job the store still holds as pending
    ///
    /// Called once at startup so jobs left pending by a previous process
    /// are picked up by the worker pool.
    pub async fn requeue_pending(&self) -> Result<usize, OrchestratorError> {
        let pending = self.jobs.pending_jobs().await?;
        for &id in &pending {
            if self.queue.send(id).is_err() {
                warn!(job_id = id, "Worker pool is not running; job stays pending");
            }
        }
        if !pending.is_empty() {
            info!("Re-queued {} pending jobs", pending.len());
        }
        Ok(pending.len())
    }

    /// Execute a pending job and record its terminal status
    pub async fn run(&self, id: JobId) -> Result<JobStatus, OrchestratorError> {
        let _claim = self.claim(id)?;

        let job = self.load(id).await?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::NotPending {
                id,
                status: job.status,
            });
        }

        debug!(job_id = id, model_key = %job.model_key, "Running prediction job");
        let pipeline = Arc::clone(&self.pipeline);
        let (model_key, input_name) = (job.model_key, job.input_name);
        let started = Instant::now();
        let outcome =
            tokio::task::spawn_blocking(move || pipeline.execute(&model_key, &input_name)).await;
        metrics::histogram!("segserve_pipeline_seconds").record(started.elapsed().as_secs_f64());

        let recorded = match outcome {
            Ok(Ok(artifact)) => self.jobs.complete_job(id, &artifact).await,
            Ok(Err(e)) => {
                warn!(job_id = id, error = %e, "Prediction job failed");
                self.jobs.fail_job(id, &e.to_string()).await
            }
            Err(e) => {
                error!(job_id = id, error = %e, "Prediction worker panicked");
                self.jobs
                    .fail_job(id, &format!("Prediction worker panicked: {}", e))
                    .await
            }
        };

        match recorded {
            Ok(job) => {
                match job.status {
                    JobStatus::Done => {
                        metrics::counter!("segserve_jobs_completed_total").increment(1)
                    }
                    _ => metrics::counter!("segserve_jobs_failed_total").increment(1),
                }
                info!(
                    job_id = id,
                    status = %job.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Prediction job finished"
                );
                Ok(job.status)
            }
            Err(e) => {
                error!(job_id = id, error = %e, "Failed to record job outcome");
                Err(e.into())
            }
        }
    }

    fn claim(&self, id: JobId) -> Result<Claim<'_>, OrchestratorError> {
        let mut claimed = self
            .claimed
            .lock()
            .map_err(|e| OrchestratorError::Internal(format!("Lock error: {}", e)))?;
        if !claimed.insert(id) {
            return Err(OrchestratorError::AlreadyRunning(id));
        }
        Ok(Claim {
            claimed: &self.claimed,
            id,
        })
    }

    /// Current status of a job
    pub async fn get_status(&self, id: JobId) -> Result<JobStatusView, OrchestratorError> {
        Ok(self.load(id).await?.into())
    }

    async fn load(&self, id: JobId) -> Result<PredictionJob, OrchestratorError> {
        self.jobs.get_job(id).await.map_err(|e| match e {
            StorageError::NotFound(_) => OrchestratorError::JobNotFound(id),
            other => OrchestratorError::Storage(other),
        })
    }
}

/// Dispatcher that runs queued jobs under a concurrency limit
pub struct WorkerPool {
    orchestrator: Arc<JobOrchestrator>,
    receiver: mpsc::UnboundedReceiver<JobId>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    fn new(
        orchestrator: Arc<JobOrchestrator>,
        receiver: mpsc::UnboundedReceiver<JobId>,
        config: &WorkerConfig,
    ) -> Self {
        let workers = config.max_concurrent_jobs.max(1);
        info!("Creating worker pool: max_concurrent_jobs={}", workers);
        Self {
            orchestrator,
            receiver,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Start the dispatcher on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Dispatcher loop; ends when the queue closes
    pub async fn run(mut self) {
        info!("Starting worker pool");

        while let Some(id) = self.receiver.recv().await {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let orchestrator = Arc::clone(&self.orchestrator);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = orchestrator.run(id).await {
                    warn!(job_id = id, error = %e, "Job not run");
                }
            });
        }

        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineConfig;
    use inference_engine::{MockLoader, MockModel, ModelCache, ModelConfig};
    use storage::{ArtifactStore, FsArtifactStore, MediaConfig, NewJob, Repository};
    use tempfile::TempDir;
    use tiling::TilingConfig;
    use tokio::time::{sleep, Duration};

    struct Fixture {
        _dir: TempDir,
        repo: Arc<Repository>,
        artifacts: Arc<FsArtifactStore>,
        orchestrator: Arc<JobOrchestrator>,
        pool: Option<WorkerPool>,
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let rgb = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 4) as u8, 128])
        });
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(rgb)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn fixture(model: MockModel) -> Fixture {
        fixture_with(MockLoader::new(model))
    }

    fn fixture_with(loader: MockLoader) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join("nitride.onnx"), b"mock").unwrap();

        let cache = ModelCache::new(
            ModelConfig {
                dir: models,
                ..Default::default()
            },
            Arc::new(loader),
        );
        let artifacts = Arc::new(
            FsArtifactStore::new(MediaConfig {
                root: dir.path().join("media"),
                ..Default::default()
            })
            .unwrap(),
        );
        let config = PipelineConfig {
            tiling: TilingConfig {
                patch_size: 16,
                stride: None,
            },
            ..Default::default()
        };
        let pipeline = Pipeline::new(&config, Arc::new(cache), artifacts.clone()).unwrap();

        let repo = Arc::new(Repository::new());
        let (orchestrator, pool) =
            JobOrchestrator::new(repo.clone(), Arc::new(pipeline), &WorkerConfig::default());

        Fixture {
            _dir: dir,
            repo,
            artifacts,
            orchestrator,
            pool: Some(pool),
        }
    }

    impl Fixture {
        async fn wait_terminal(&self, id: JobId) -> JobStatus {
            let mut status = self.orchestrator.get_status(id).await.unwrap().status;
            for _ in 0..500 {
                if status.is_terminal() {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
                status = self.orchestrator.get_status(id).await.unwrap().status;
            }
            status
        }

        async fn submit(&self, key: &str, bytes: &[u8]) -> JobId {
            let name = format!("upload_{}.png", self.repo.job_count().await.unwrap());
            let input = self.artifacts.put(&name, bytes).unwrap();
            self.orchestrator.create(1, key, input).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_create_is_pending() {
        let fx = fixture(MockModel::luminance());
        let id = fx.submit("nitride", &png_bytes(32, 32)).await;

        let status = fx.orchestrator.get_status(id).await.unwrap();
        assert_eq!(status.status, JobStatus::Pending);
        assert!(status.output_image.is_none());
        assert!(status.error.is_none());
        assert!(status.input_image.starts_with("https://"));
    }

    #[tokio::test]
    async fn test_run_completes_job() {
        let fx = fixture(MockModel::luminance());
        let id = fx.submit("nitride", &png_bytes(40, 32)).await;

        assert_eq!(fx.orchestrator.run(id).await.unwrap(), JobStatus::Done);

        let status = fx.orchestrator.get_status(id).await.unwrap();
        assert_eq!(status.status, JobStatus::Done);
        let url = status.output_image.unwrap();
        assert!(url.contains("output_image_enhanced_"));
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_run_refused() {
        let fx = fixture_with(
            MockLoader::new(MockModel::luminance()).with_delay(Duration::from_millis(300)),
        );
        let id = fx.submit("nitride", &png_bytes(32, 32)).await;

        let orchestrator = Arc::clone(&fx.orchestrator);
        let first = tokio::spawn(async move { orchestrator.run(id).await });
        sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            fx.orchestrator.run(id).await,
            Err(OrchestratorError::AlreadyRunning(_))
        ));
        assert_eq!(first.await.unwrap().unwrap(), JobStatus::Done);
        let before = fx.orchestrator.get_status(id).await.unwrap();

        // Once finished the claim is released and the store refuses a re-run
        assert!(fx.orchestrator.claimed.lock().unwrap().is_empty());
        assert!(matches!(
            fx.orchestrator.run(id).await,
            Err(OrchestratorError::NotPending {
                status: JobStatus::Done,
                ..
            })
        ));
        assert_eq!(fx.orchestrator.get_status(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_claims_released_after_run() {
        let fx = fixture(MockModel::luminance());
        let ok = fx.submit("nitride", &png_bytes(32, 32)).await;
        let broken = fx.submit("nitride", b"broken").await;

        fx.orchestrator.run(ok).await.unwrap();
        fx.orchestrator.run(broken).await.unwrap();
        let _ = fx.orchestrator.run(404).await;

        assert!(fx.orchestrator.claimed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_pending_jobs() {
        let mut fx = fixture(MockModel::luminance());
        // Left pending by an earlier process: stored but never queued here
        let input = fx.artifacts.put("left_over.png", &png_bytes(32, 32)).unwrap();
        let orphan = fx
            .repo
            .create_job(NewJob {
                model_id: 1,
                model_key: "nitride".to_string(),
                input,
            })
            .await
            .unwrap();
        let finished = fx.submit("nitride", &png_bytes(32, 32)).await;
        fx.orchestrator.run(finished).await.unwrap();

        assert_eq!(fx.orchestrator.requeue_pending().await.unwrap(), 1);
        fx.pool.take().unwrap().spawn();

        assert_eq!(fx.wait_terminal(orphan.id).await, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_terminal_job_not_rerun() {
        let fx = fixture(MockModel::luminance());
        let id = fx.submit("nitride", &png_bytes(32, 32)).await;
        fx.repo.fail_job(id, "cancelled upstream").await.unwrap();

        assert!(matches!(
            fx.orchestrator.run(id).await,
            Err(OrchestratorError::NotPending {
                status: JobStatus::Error,
                ..
            })
        ));
        let status = fx.orchestrator.get_status(id).await.unwrap();
        assert_eq!(status.error.as_deref(), Some("cancelled upstream"));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let fx = fixture(MockModel::luminance());
        assert!(matches!(
            fx.orchestrator.get_status(404).await,
            Err(OrchestratorError::JobNotFound(404))
        ));
        assert!(matches!(
            fx.orchestrator.run(404).await,
            Err(OrchestratorError::JobNotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_pipeline_error_recorded() {
        let fx = fixture(MockModel::luminance());
        let id = fx.submit("nitride", b"definitely not an image").await;

        assert_eq!(fx.orchestrator.run(id).await.unwrap(), JobStatus::Error);

        let status = fx.orchestrator.get_status(id).await.unwrap();
        assert_eq!(status.status, JobStatus::Error);
        assert!(status.output_image.is_none());
        assert!(status.error.unwrap().starts_with("Tiling failed"));
    }

    #[tokio::test]
    async fn test_missing_model_recorded() {
        let fx = fixture(MockModel::luminance());
        let id = fx.submit("retired-model", &png_bytes(32, 32)).await;

        assert_eq!(fx.orchestrator.run(id).await.unwrap(), JobStatus::Error);
        let error = fx.orchestrator.get_status(id).await.unwrap().error.unwrap();
        assert!(error.contains("retired-model"));
    }

    #[tokio::test]
    async fn test_worker_pool_drains_queue() {
        let mut fx = fixture(MockModel::luminance());
        let ids = vec![
            fx.submit("nitride", &png_bytes(32, 32)).await,
            fx.submit("nitride", &png_bytes(48, 32)).await,
            fx.submit("nitride", b"broken").await,
        ];
        fx.pool.take().unwrap().spawn();

        let mut statuses = Vec::new();
        for id in &ids {
            statuses.push(fx.wait_terminal(*id).await);
        }

        assert_eq!(
            statuses,
            vec![JobStatus::Done, JobStatus::Done, JobStatus::Error]
        );
    }
}
