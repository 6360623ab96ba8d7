//! Segmentation model capability and its loaders

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ndarray::{s, Array4, ArrayView4, Axis};
use tiling::PATCH_CHANNELS;
use tracing::{debug, info};
use tract_onnx::prelude::*;

use crate::losses::CustomObjects;
use crate::InferenceError;

/// A loaded model that maps a 1 x H x W x C batch to a 1 x H x W x K
/// probability batch. Implementations must tolerate concurrent `predict` calls.
pub trait SegmentationModel: Send + Sync {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError>;
}

/// Deserializes a model file into a runnable handle
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
        custom_objects: &CustomObjects,
    ) -> Result<Arc<dyn SegmentationModel>, InferenceError>;
}

/// ONNX model executed by tract
pub struct TractModel {
    plan: TypedRunnableModel<TypedModel>,
}

impl TractModel {
    /// Optimize a typed graph and make it runnable
    pub fn from_typed(model: TypedModel) -> Result<Self, InferenceError> {
        let plan = Self::plan(model).map_err(|e| InferenceError::ModelLoadError(e.to_string()))?;
        Ok(Self { plan })
    }

    fn plan(model: TypedModel) -> TractResult<TypedRunnableModel<TypedModel>> {
        model.into_optimized()?.into_runnable()
    }
}

impl SegmentationModel for TractModel {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError> {
        let shape = input.shape().to_vec();
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_shape(&shape, &data)
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::InferenceFailed("model produced no outputs".into()))?;

        let out_shape = output.shape().to_vec();
        let values = output
            .as_slice::<f32>()
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?
            .to_vec();

        let dims = match out_shape.as_slice() {
            &[n, h, w, k] => (n, h, w, k),
            // Some exports squeeze the trailing channel axis
            &[n, h, w] => (n, h, w, 1),
            other => {
                return Err(InferenceError::ShapeMismatch {
                    expected: "rank 4 output".to_string(),
                    actual: format!("{:?}", other),
                })
            }
        };
        Array4::from_shape_vec(dims, values)
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))
    }
}

/// Loads ONNX files with tract, pinning the input to one patch
#[derive(Debug, Clone)]
pub struct TractLoader {
    patch_size: usize,
}

impl TractLoader {
    pub fn new(patch_size: usize) -> Self {
        Self { patch_size }
    }
}

impl ModelLoader for TractLoader {
    fn load(
        &self,
        path: &Path,
        custom_objects: &CustomObjects,
    ) -> Result<Arc<dyn SegmentationModel>, InferenceError> {
        let p = self.patch_size;
        // ONNX exports inline the graph; training-only symbols are only logged
        debug!(symbols = ?custom_objects.names(), "Custom objects available to loader");

        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| model.with_input_fact(0, f32::fact([1, p, p, PATCH_CHANNELS]).into()))
            .and_then(|model| model.into_typed())
            .and_then(TractModel::plan)
            .map_err(|e| InferenceError::ModelLoadError(format!("{}: {}", path.display(), e)))?;

        info!("Loaded ONNX model from {}", path.display());
        Ok(Arc::new(TractModel { plan }))
    }
}

#[derive(Debug, Clone, Copy)]
enum MockMode {
    Luminance,
    Constant(f32),
    Cropped,
}

/// Model stand-in for development and tests
///
/// The default mode predicts the mean of the three color channels, so
/// bright regions read as foreground.
#[derive(Debug, Clone, Copy)]
pub struct MockModel {
    mode: MockMode,
}

impl MockModel {
    pub fn luminance() -> Self {
        Self {
            mode: MockMode::Luminance,
        }
    }

    pub fn constant(value: f32) -> Self {
        Self {
            mode: MockMode::Constant(value),
        }
    }

    /// Returns a tile one pixel smaller than its input
    pub fn cropped() -> Self {
        Self {
            mode: MockMode::Cropped,
        }
    }
}

impl SegmentationModel for MockModel {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError> {
        let (n, h, w, _) = input.dim();
        let output = match self.mode {
            MockMode::Luminance => {
                let color = input.slice(s![.., .., .., 0..3]);
                color
                    .mean_axis(Axis(3))
                    .ok_or_else(|| InferenceError::InferenceFailed("empty input".into()))?
                    .insert_axis(Axis(3))
            }
            MockMode::Constant(value) => Array4::from_elem((n, h, w, 1), value),
            MockMode::Cropped => {
                Array4::zeros((n, h.saturating_sub(1), w.saturating_sub(1), 1))
            }
        };
        Ok(output)
    }
}

/// Loader that hands out a [`MockModel`] and counts loads
#[derive(Debug)]
pub struct MockLoader {
    model: MockModel,
    loads: AtomicUsize,
    delay: Option<Duration>,
}

impl MockLoader {
    pub fn new(model: MockModel) -> Self {
        Self {
            model,
            loads: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Sleep during each load, widening the window for concurrent misses
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `load` has run
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockLoader {
    fn load(
        &self,
        path: &Path,
        _custom_objects: &CustomObjects,
    ) -> Result<Arc<dyn SegmentationModel>, InferenceError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        debug!("Mock load of {}", path.display());
        Ok(Arc::new(self.model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InferenceRunner;
    use ndarray::Array3;
    use tiling::{Image, PatchExtractor};

    #[test]
    fn test_mock_luminance_prediction() {
        let mut input = Array4::<f32>::zeros((1, 2, 2, PATCH_CHANNELS));
        input[[0, 1, 1, 0]] = 0.9;
        input[[0, 1, 1, 1]] = 0.6;
        input[[0, 1, 1, 2]] = 0.3;
        // Positional channels must not leak into the prediction
        input[[0, 0, 0, 3]] = 1.0;

        let output = MockModel::luminance().predict(input.view()).unwrap();
        assert_eq!(output.dim(), (1, 2, 2, 1));
        assert!((output[[0, 1, 1, 0]] - 0.6).abs() < 1e-6);
        assert_eq!(output[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_mock_loader_counts_loads() {
        let loader = MockLoader::new(MockModel::constant(0.5));
        let objects = CustomObjects::with_defaults();
        loader.load(Path::new("a.onnx"), &objects).unwrap();
        loader.load(Path::new("b.onnx"), &objects).unwrap();
        assert_eq!(loader.load_count(), 2);
    }

    #[test]
    fn test_tract_identity_graph_through_runner() {
        let mut graph = TypedModel::default();
        let input = graph
            .add_source("input", f32::fact([1, 4, 4, PATCH_CHANNELS]))
            .unwrap();
        graph.set_output_outlets(&[input]).unwrap();
        let model = TractModel::from_typed(graph).unwrap();

        let pixels = Array3::from_shape_fn((8, 8, 3), |(y, x, c)| {
            (y * 8 + x) as f32 / 64.0 + c as f32 * 0.001
        });
        let image = Image::from_array(pixels).unwrap();
        let patches = PatchExtractor::new(4, 2).unwrap().extract(&image).unwrap();
        let runner = InferenceRunner::new();

        for patch in &patches {
            let tile = runner.run(&model, patch).unwrap();
            assert_eq!(tile.dim(), (4, 4));
            assert_eq!(tile[[1, 2]], image.view()[[patch.y + 1, patch.x + 2, 0]]);
        }
    }

    #[test]
    fn test_tract_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.onnx");
        std::fs::write(&path, b"not a protobuf").unwrap();

        let result = TractLoader::new(16).load(&path, &CustomObjects::with_defaults());
        assert!(matches!(result, Err(InferenceError::ModelLoadError(_))));
    }
}
