//! Tiled segmentation pipeline
//!
//! Synchronous and CPU-bound; the orchestrator runs it on a blocking thread.

use std::sync::Arc;

use inference_engine::{InferenceRunner, ModelCache, SegmentationModel};
use postprocess::{ArtifactRenderer, Enhancer, RenderConfig};
use serde::{Deserialize, Serialize};
use storage::{ArtifactRef, ArtifactStore};
use tiling::{Image, PatchExtractor, ProbabilityMap, Stitcher, TilingConfig};
use tracing::{debug, info};

use crate::PipelineError;

/// Pipeline stage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tiling: TilingConfig,
    pub enhance: Enhancer,
    pub render: RenderConfig,
}

/// Image in, rendered artifact out
pub struct Pipeline {
    extractor: PatchExtractor,
    runner: InferenceRunner,
    enhancer: Enhancer,
    renderer: ArtifactRenderer,
    cache: Arc<ModelCache>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        cache: Arc<ModelCache>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Self, PipelineError> {
        let extractor = PatchExtractor::from_config(&config.tiling)?;
        info!(
            patch_size = extractor.patch_size(),
            stride = extractor.stride(),
            "Creating segmentation pipeline"
        );
        Ok(Self {
            extractor,
            runner: InferenceRunner::new(),
            enhancer: config.enhance,
            renderer: ArtifactRenderer::new(config.render.clone()),
            cache,
            artifacts,
        })
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Run every patch of `image` through `model` and stitch the tiles
    pub fn predict(
        &self,
        model: &dyn SegmentationModel,
        image: &Image,
    ) -> Result<ProbabilityMap, PipelineError> {
        let mut stitcher = Stitcher::new(image.height(), image.width());
        for patch in self.extractor.patches(image)? {
            let tile = self.runner.run(model, &patch)?;
            stitcher.add(patch.y, patch.x, tile.view())?;
        }
        Ok(stitcher.finish())
    }

    /// Full run for one stored input: decode, predict, enhance, render, persist
    pub fn execute(&self, model_key: &str, input_name: &str) -> Result<ArtifactRef, PipelineError> {
        let bytes = self.artifacts.get(input_name)?;
        let image = Image::from_bytes(&bytes)?;
        debug!(
            model_key,
            "Decoded {} ({}x{})",
            input_name,
            image.height(),
            image.width()
        );

        let model = self.cache.get_or_load(model_key)?;
        let probabilities = self.predict(model.as_ref(), &image)?;
        let enhanced = self.enhancer.enhance(&probabilities);

        Ok(self
            .renderer
            .persist(&image, &enhanced, self.artifacts.as_ref())?)
    }
}
