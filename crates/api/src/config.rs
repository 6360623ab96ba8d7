//! Service configuration
//!
//! Loaded from an optional TOML file (`segserve.toml`, or the path in
//! `SEGSERVE_CONFIG`) overlaid by `SEGSERVE_*` environment variables, with
//! `__` separating nested keys: `SEGSERVE_MEDIA__HOST=api.example.com`.

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use inference_engine::ModelConfig;
use orchestrator::{PipelineConfig, WorkerConfig};
use postprocess::{Enhancer, RenderConfig};
use serde::{Deserialize, Serialize};
use storage::MediaConfig;
use tiling::TilingConfig;

use crate::rate_limit::RateLimitConfig;

const DEFAULT_CONFIG_FILE: &str = "segserve.toml";

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Request body limit for uploads
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            max_upload_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Record storage; no URL keeps records in memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// e.g. `sqlite://segserve.db`
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics at `/metrics`
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub models: ModelConfig,
    pub tiling: TilingConfig,
    pub enhance: Enhancer,
    pub render: RenderConfig,
    pub workers: WorkerConfig,
    /// Per-IP limit on the prediction trigger; absent disables it
    pub rate_limit: Option<RateLimitConfig>,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
}

impl Settings {
    /// Load from `SEGSERVE_CONFIG` (or `segserve.toml`) and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var("SEGSERVE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    /// Load from a specific file (which may be absent) and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("SEGSERVE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Stage settings handed to the pipeline
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            tiling: self.tiling.clone(),
            enhance: self.enhance,
            render: self.render.clone(),
        }
    }
}
