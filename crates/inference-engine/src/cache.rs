//! Model Cache
//!
//! Keeps every loaded model for the lifetime of the process. The miss path
//! (check, load, insert) runs under one mutex so concurrent first requests
//! for the same key deserialize the model once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::losses::CustomObjects;
use crate::model::{ModelLoader, SegmentationModel};
use crate::InferenceError;

/// Model file layout: `<dir>/<key>.<extension>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory holding serialized models
    pub dir: PathBuf,
    /// File extension appended to the key
    pub extension: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            extension: "onnx".to_string(),
        }
    }
}

/// Keyed store of loaded models
pub struct ModelCache {
    config: ModelConfig,
    loader: Arc<dyn ModelLoader>,
    custom_objects: CustomObjects,
    models: Mutex<HashMap<String, Arc<dyn SegmentationModel>>>,
}

impl ModelCache {
    /// Create an empty cache; custom objects default to the training symbols
    pub fn new(config: ModelConfig, loader: Arc<dyn ModelLoader>) -> Self {
        info!(
            "Creating model cache for {} (*.{})",
            config.dir.display(),
            config.extension
        );
        Self {
            config,
            loader,
            custom_objects: CustomObjects::with_defaults(),
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the custom object registry handed to the loader
    pub fn with_custom_objects(mut self, custom_objects: CustomObjects) -> Self {
        self.custom_objects = custom_objects;
        self
    }

    /// Return the cached model for `key`, loading it on first use
    pub fn get_or_load(&self, key: &str) -> Result<Arc<dyn SegmentationModel>, InferenceError> {
        let mut models = self
            .models
            .lock()
            .map_err(|e| InferenceError::InferenceFailed(format!("Lock error: {}", e)))?;

        if let Some(model) = models.get(key) {
            debug!(key, "Model cache hit");
            return Ok(Arc::clone(model));
        }

        let path = self.ensure_exists(key)?;
        info!(key, "Model cache miss, loading {}", path.display());
        let model = self.loader.load(&path, &self.custom_objects)?;
        models.insert(key.to_string(), Arc::clone(&model));
        metrics::counter!("segserve_models_loaded_total").increment(1);

        Ok(model)
    }

    /// Resolve the model file for `key`, failing if it does not exist
    pub fn ensure_exists(&self, key: &str) -> Result<PathBuf, InferenceError> {
        let path = self.model_path(key);
        if !is_plain_key(key) || !path.is_file() {
            warn!(key, "Model file not found at {}", path.display());
            return Err(InferenceError::ModelNotFound {
                key: key.to_string(),
                path: path.display().to_string(),
            });
        }
        Ok(path)
    }

    /// Path where the model for `key` is expected
    pub fn model_path(&self, key: &str) -> PathBuf {
        self.config
            .dir
            .join(format!("{}.{}", key, self.config.extension))
    }

    /// Whether `key` is already loaded
    pub fn contains(&self, key: &str) -> bool {
        self.models
            .lock()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    /// Number of loaded models
    pub fn len(&self) -> usize {
        self.models.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn custom_objects(&self) -> &CustomObjects {
        &self.custom_objects
    }
}

/// Keys name a file inside the model directory, never a path out of it
fn is_plain_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(['/', '\\']) && key != "." && key != ".."
}
