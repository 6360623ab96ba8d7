//! ONNX Inference Engine
//!
//! Runs a single-class segmentation model over image patches. Models are
//! loaded once per key and shared through [`ModelCache`].

mod cache;
pub mod losses;
mod model;
mod runner;

pub use cache::{ModelCache, ModelConfig};
pub use losses::CustomObjects;
pub use model::{MockLoader, MockModel, ModelLoader, SegmentationModel, TractLoader, TractModel};
pub use runner::InferenceRunner;

use thiserror::Error;

/// Errors during inference
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model '{key}' not found at {path}")]
    ModelNotFound { key: String, path: String },
    #[error("Model load failed: {0}")]
    ModelLoadError(String),
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}
