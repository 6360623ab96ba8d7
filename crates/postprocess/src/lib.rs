//! Segmentation Post-processing
//!
//! - Logistic contrast enhancement of stitched probability maps
//! - Two-panel composite rendering (source image, color-mapped prediction)

mod colormap;
pub mod enhance;
pub mod render;

pub use colormap::reds;
pub use enhance::{EnhancedMap, Enhancer};
pub use render::{ArtifactRenderer, RenderConfig};

use storage::StorageError;
use thiserror::Error;

/// Rendering errors
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Image encoding failed: {0}")]
    Encode(String),
    #[error("Font unavailable: {0}")]
    Font(String),
    #[error("Cannot render an empty map")]
    EmptyMap,
    #[error("Map is {map_height}x{map_width} but image is {image_height}x{image_width}")]
    ShapeMismatch {
        map_height: usize,
        map_width: usize,
        image_height: usize,
        image_width: usize,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}
