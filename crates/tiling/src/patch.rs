//! Overlapping patch extraction with positional channels

use ndarray::{s, Array3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Image, TilingError};

/// Channels per patch: RGB plus column and row position
pub const PATCH_CHANNELS: usize = 5;

/// Tiling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Side length of the square patch fed to the model
    pub patch_size: usize,
    /// Step between patch origins; `None` means half a patch
    pub stride: Option<usize>,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            patch_size: 256,
            stride: None,
        }
    }
}

/// A patch_size x patch_size x 5 tile and its top-left origin in the source image
#[derive(Debug, Clone)]
pub struct Patch {
    /// Row of the top-left corner
    pub y: usize,
    /// Column of the top-left corner
    pub x: usize,
    /// Channels 0..3 are color, 3 is the column fraction, 4 is the row fraction
    pub data: Array3<f32>,
}

impl Patch {
    pub fn origin(&self) -> (usize, usize) {
        (self.y, self.x)
    }

    pub fn size(&self) -> usize {
        self.data.dim().0
    }
}

/// Splits images into overlapping patches
#[derive(Debug, Clone, Copy)]
pub struct PatchExtractor {
    patch_size: usize,
    stride: usize,
}

impl PatchExtractor {
    /// Create an extractor with an explicit stride
    pub fn new(patch_size: usize, stride: usize) -> Result<Self, TilingError> {
        if patch_size == 0 || stride == 0 {
            return Err(TilingError::InvalidStride { patch_size, stride });
        }
        Ok(Self { patch_size, stride })
    }

    /// Half-patch stride, the default for inference
    pub fn overlapping(patch_size: usize) -> Result<Self, TilingError> {
        Self::new(patch_size, (patch_size / 2).max(1))
    }

    /// Stride equal to the patch size
    pub fn non_overlapping(patch_size: usize) -> Result<Self, TilingError> {
        Self::new(patch_size, patch_size)
    }

    pub fn from_config(config: &TilingConfig) -> Result<Self, TilingError> {
        match config.stride {
            Some(stride) => Self::new(config.patch_size, stride),
            None => Self::overlapping(config.patch_size),
        }
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Start offsets along one axis, with a trailing offset that reaches the edge
    pub fn offsets(&self, extent: usize) -> Vec<usize> {
        if extent < self.patch_size {
            return Vec::new();
        }
        let last = extent - self.patch_size;
        let mut offsets: Vec<usize> = (0..=last).step_by(self.stride).collect();
        if offsets.last() != Some(&last) {
            offsets.push(last);
        }
        offsets
    }

    /// Patch origins (y, x) in row-major order
    pub fn origins(&self, height: usize, width: usize) -> Result<Vec<(usize, usize)>, TilingError> {
        self.check_dimensions(height, width)?;
        let rows = self.offsets(height);
        let cols = self.offsets(width);
        Ok(rows
            .iter()
            .flat_map(|&y| cols.iter().map(move |&x| (y, x)))
            .collect())
    }

    /// Lazily produce patches, materializing one at a time
    pub fn patches<'a>(&self, image: &'a Image) -> Result<PatchIter<'a>, TilingError> {
        let origins = self.origins(image.height(), image.width())?;
        debug!(
            patch_size = self.patch_size,
            stride = self.stride,
            count = origins.len(),
            "Planned patches for {}x{} image",
            image.height(),
            image.width()
        );
        Ok(PatchIter {
            image,
            patch_size: self.patch_size,
            origins: origins.into_iter(),
        })
    }

    /// Extract every patch up front
    pub fn extract(&self, image: &Image) -> Result<Vec<Patch>, TilingError> {
        Ok(self.patches(image)?.collect())
    }

    fn check_dimensions(&self, height: usize, width: usize) -> Result<(), TilingError> {
        if self.patch_size > height || self.patch_size > width {
            return Err(TilingError::InvalidDimension {
                patch_size: self.patch_size,
                height,
                width,
            });
        }
        Ok(())
    }
}

/// Iterator over the patches of one image
pub struct PatchIter<'a> {
    image: &'a Image,
    patch_size: usize,
    origins: std::vec::IntoIter<(usize, usize)>,
}

impl PatchIter<'_> {
    fn build(&self, y: usize, x: usize) -> Patch {
        let p = self.patch_size;
        let (height, width) = (self.image.height() as f32, self.image.width() as f32);
        let mut data = Array3::<f32>::zeros((p, p, PATCH_CHANNELS));

        data.slice_mut(s![.., .., 0..3])
            .assign(&self.image.view().slice(s![y..y + p, x..x + p, ..]));

        // Positions are fractions of the full image, not of the patch
        for i in 0..p {
            let row_fraction = (y + i) as f32 / height;
            for j in 0..p {
                data[[i, j, 3]] = (x + j) as f32 / width;
                data[[i, j, 4]] = row_fraction;
            }
        }

        Patch { y, x, data }
    }
}

impl Iterator for PatchIter<'_> {
    type Item = Patch;

    fn next(&mut self) -> Option<Patch> {
        let (y, x) = self.origins.next()?;
        Some(self.build(y, x))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.origins.size_hint()
    }
}

impl ExactSizeIterator for PatchIter<'_> {}
