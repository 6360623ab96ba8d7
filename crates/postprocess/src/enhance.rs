//! Asymmetric contrast enhancement
//!
//! A logistic curve centered below 0.5 pushes mid-range probabilities down
//! and lifts high ones, then min-max renormalization stretches the result
//! back to the full [0, 1] range.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tiling::ProbabilityMap;
use tracing::debug;

/// Probability map after enhancement
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedMap {
    values: Array2<f32>,
}

impl EnhancedMap {
    pub fn height(&self) -> usize {
        self.values.dim().0
    }

    pub fn width(&self) -> usize {
        self.values.dim().1
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }
}

/// Logistic remap parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Enhancer {
    /// Input value mapped to the curve's midpoint
    pub center: f32,
    /// Slope of the curve at the midpoint
    pub steepness: f32,
}

impl Default for Enhancer {
    fn default() -> Self {
        Self {
            center: 0.45,
            steepness: 10.0,
        }
    }
}

impl Enhancer {
    pub fn new(center: f32, steepness: f32) -> Self {
        Self { center, steepness }
    }

    /// Logistic value for one probability, input clamped to [0, 1]
    pub fn remap(&self, x: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        1.0 / (1.0 + (-self.steepness * (x - self.center)).exp())
    }

    /// Remap every pixel and renormalize to [0, 1]
    ///
    /// A constant map has no range to stretch; its remapped values are
    /// returned as they are, so a uniformly confident map stays high and a
    /// uniformly empty one stays low.
    pub fn enhance(&self, map: &ProbabilityMap) -> EnhancedMap {
        let mut values = map.view().mapv(|x| self.remap(x));

        let (min, max) = values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = max - min;

        if range > f32::EPSILON {
            values.mapv_inplace(|v| (v - min) / range);
        } else {
            debug!("Constant probability map, skipping renormalization");
        }

        EnhancedMap { values }
    }
}
