//! Segmentation Prediction API Server
//!
//! REST API for registering segmentation models, submitting images for
//! tiled inference and polling prediction jobs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use inference_engine::{ModelCache, ModelLoader};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use orchestrator::{JobOrchestrator, Pipeline, WorkerPool};
use serde::Serialize;
use storage::{
    ArtifactStore, FsArtifactStore, JobStore, ModelStore, Repository, SqliteRepository,
};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod error;
pub mod rate_limit;
mod routes;

pub use config::Settings;
pub use error::{ApiError, StartupError};

/// Application state shared across handlers
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub models: Arc<dyn ModelStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub orchestrator: Arc<JobOrchestrator>,
    /// Present when metrics export is enabled and the recorder installed
    pub metrics: Option<PrometheusHandle>,
    pub version: String,
    pub start_time: Instant,
}

impl AppState {
    /// Wire storage, model cache, pipeline and orchestrator from settings
    ///
    /// The returned worker pool must be spawned for queued jobs to run.
    pub async fn build(
        settings: &Settings,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<(Arc<Self>, WorkerPool), StartupError> {
        let jobs: Arc<dyn JobStore>;
        let models: Arc<dyn ModelStore>;
        match &settings.storage.database_url {
            Some(url) => {
                let repo = Arc::new(SqliteRepository::connect(url).await?);
                jobs = repo.clone();
                models = repo;
            }
            None => {
                let repo = Arc::new(Repository::new());
                jobs = repo.clone();
                models = repo;
            }
        }

        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(FsArtifactStore::new(settings.media.clone())?);
        let cache = Arc::new(ModelCache::new(settings.models.clone(), loader));
        let pipeline = Pipeline::new(&settings.pipeline(), cache, Arc::clone(&artifacts))?;
        let (orchestrator, pool) =
            JobOrchestrator::new(Arc::clone(&jobs), Arc::new(pipeline), &settings.workers);
        orchestrator.requeue_pending().await?;

        let metrics = if settings.metrics.enabled {
            match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Metrics recorder not installed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let state = Self {
            jobs,
            models,
            artifacts,
            orchestrator,
            metrics,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
        };
        Ok((Arc::new(state), pool))
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub job_count: usize,
    pub model_count: usize,
    pub loaded_models: usize,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>, settings: &Settings) -> Result<Router, StartupError> {
    let media_path = settings.media.url_path.trim_matches('/');
    if media_path.is_empty() {
        return Err(StartupError::MediaPath(settings.media.url_path.clone()));
    }
    let media_route = format!("/{}", media_path);

    let mut trigger = Router::new().route(
        "/api/v1/models/:id/predict",
        post(routes::predictions::trigger_prediction),
    );
    if let Some(limits) = &settings.rate_limit {
        info!(
            "Rate limiting predictions: burst {} per {}s",
            limits.burst_size, limits.per_second
        );
        trigger = trigger.layer(rate_limit::trigger_layer(limits)?);
    }

    Ok(Router::new()
        .route("/api/v1/health", get(health_handler))
        .route(
            "/api/v1/models",
            get(routes::models::list_models).post(routes::models::create_model),
        )
        .route("/api/v1/models/:id", get(routes::models::get_model))
        .route("/api/v1/predictions/:id", get(routes::predictions::get_prediction))
        .route("/metrics", get(metrics_handler))
        .merge(trigger)
        .nest_service(&media_route, ServeDir::new(&settings.media.root))
        .layer(DefaultBodyLimit::max(settings.server.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        job_count: state.jobs.job_count().await?,
        model_count: state.models.model_count().await?,
        loaded_models: state.orchestrator.pipeline().cache().len(),
    };

    Ok(Json(response))
}

/// Prometheus exposition
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled".to_string()),
    }
}

/// Initialize logging; later calls keep the first subscriber
pub fn init_logging(config: &config::LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Run the server until it fails
pub async fn run_server(settings: Settings, loader: Arc<dyn ModelLoader>) -> Result<(), StartupError> {
    let (state, pool) = AppState::build(&settings, loader).await?;
    pool.spawn();
    let app = create_router(state, &settings)?;

    info!("Starting API server on {}", settings.server.bind);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
