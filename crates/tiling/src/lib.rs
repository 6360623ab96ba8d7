//! Tiling for Large-Image Segmentation
//!
//! Splits an image that is larger than a model's native input into
//! overlapping, positionally-encoded patches and stitches per-patch
//! predictions back into one full-resolution probability map.

pub mod image;
pub mod patch;
pub mod stitch;

pub use crate::image::Image;
pub use patch::{Patch, PatchExtractor, PatchIter, TilingConfig, PATCH_CHANNELS};
pub use stitch::{ProbabilityMap, Stitcher};

use thiserror::Error;

/// Tiling errors
#[derive(Debug, Error)]
pub enum TilingError {
    #[error("Patch size {patch_size} exceeds image dimensions {height}x{width}")]
    InvalidDimension {
        patch_size: usize,
        height: usize,
        width: usize,
    },
    #[error("Invalid stride {stride} for patch size {patch_size}")]
    InvalidStride { patch_size: usize, stride: usize },
    #[error("Tile {tile_height}x{tile_width} at ({y}, {x}) does not fit in {height}x{width} map")]
    TileOutOfBounds {
        y: usize,
        x: usize,
        tile_height: usize,
        tile_width: usize,
        height: usize,
        width: usize,
    },
    #[error("Expected 3 color channels, got {0}")]
    InvalidChannels(usize),
    #[error("Image decode failed: {0}")]
    Decode(String),
}
