//! Per-patch inference

use ndarray::{s, Array2, Axis};
use tiling::Patch;
use tracing::trace;

use crate::model::SegmentationModel;
use crate::InferenceError;

/// Runs one patch through a model and returns its probability tile
#[derive(Debug, Clone, Copy, Default)]
pub struct InferenceRunner;

impl InferenceRunner {
    pub fn new() -> Self {
        Self
    }

    /// Predict the foreground probability for every pixel of `patch`
    pub fn run(
        &self,
        model: &dyn SegmentationModel,
        patch: &Patch,
    ) -> Result<Array2<f32>, InferenceError> {
        let (height, width, _) = patch.data.dim();
        let batch = patch.data.view().insert_axis(Axis(0));
        let output = model.predict(batch)?;

        let (n, out_height, out_width, channels) = output.dim();
        if n != 1 || channels == 0 || out_height != height || out_width != width {
            return Err(InferenceError::ShapeMismatch {
                expected: format!("1x{}x{}xK", height, width),
                actual: format!("{}x{}x{}x{}", n, out_height, out_width, channels),
            });
        }

        trace!(y = patch.y, x = patch.x, "Patch inference complete");
        // Single-class segmentation: the first channel is the foreground
        Ok(output.slice(s![0, .., .., 0]).to_owned())
    }
}
