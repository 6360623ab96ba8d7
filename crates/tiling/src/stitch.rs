//! Prediction stitching
//!
//! Tile predictions are summed into a full-resolution accumulator while a
//! coverage map counts contributions per pixel. Dividing by coverage averages
//! overlap regions instead of summing them, which removes seams at tile edges.

use ndarray::{s, Array2, ArrayView2};
use tracing::debug;

use crate::TilingError;

/// Full-resolution probability map in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityMap {
    values: Array2<f32>,
}

impl ProbabilityMap {
    /// Wrap values as-is
    pub fn from_array(values: Array2<f32>) -> Self {
        Self { values }
    }

    pub fn height(&self) -> usize {
        self.values.dim().0
    }

    pub fn width(&self) -> usize {
        self.values.dim().1
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.values
    }
}

/// Accumulates tile predictions into a probability map
#[derive(Debug)]
pub struct Stitcher {
    accumulated: Array2<f64>,
    coverage: Array2<u32>,
    tiles: usize,
}

impl Stitcher {
    /// Create a zeroed stitcher for a height x width target
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            accumulated: Array2::zeros((height, width)),
            coverage: Array2::zeros((height, width)),
            tiles: 0,
        }
    }

    /// Add one tile prediction whose top-left corner is at (y, x)
    pub fn add(&mut self, y: usize, x: usize, tile: ArrayView2<'_, f32>) -> Result<(), TilingError> {
        let (tile_height, tile_width) = tile.dim();
        let (height, width) = self.accumulated.dim();
        if y + tile_height > height || x + tile_width > width {
            return Err(TilingError::TileOutOfBounds {
                y,
                x,
                tile_height,
                tile_width,
                height,
                width,
            });
        }

        self.accumulated
            .slice_mut(s![y..y + tile_height, x..x + tile_width])
            .zip_mut_with(&tile, |acc, &v| *acc += v as f64);
        self.coverage
            .slice_mut(s![y..y + tile_height, x..x + tile_width])
            .mapv_inplace(|c| c + 1);
        self.tiles += 1;
        Ok(())
    }

    /// Number of tiles added so far
    pub fn tile_count(&self) -> usize {
        self.tiles
    }

    /// Per-pixel contribution counts
    pub fn coverage(&self) -> ArrayView2<'_, u32> {
        self.coverage.view()
    }

    /// Average by coverage and clamp to [0, 1]; uncovered pixels stay 0
    pub fn finish(self) -> ProbabilityMap {
        let mut values = Array2::<f32>::zeros(self.accumulated.dim());
        ndarray::Zip::from(&mut values)
            .and(&self.accumulated)
            .and(&self.coverage)
            .for_each(|out, &sum, &count| {
                if count > 0 {
                    *out = ((sum / count as f64) as f32).clamp(0.0, 1.0);
                }
            });

        debug!(
            tiles = self.tiles,
            "Stitched {}x{} probability map",
            values.dim().0,
            values.dim().1
        );
        ProbabilityMap { values }
    }
}
