//! Source image type

use ndarray::{Array3, ArrayView3};

use crate::TilingError;

/// Decoded RGB image with samples in [0, 1], laid out as H x W x 3
#[derive(Debug, Clone)]
pub struct Image {
    pixels: Array3<f32>,
}

impl Image {
    /// Decode an encoded raster (PNG, JPEG, ...) into a normalized RGB image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TilingError> {
        let decoded =
            ::image::load_from_memory(bytes).map_err(|e| TilingError::Decode(e.to_string()))?;
        Ok(Self::from_rgb8(&decoded.to_rgb8()))
    }

    /// Build from an 8-bit RGB buffer
    pub fn from_rgb8(rgb: &::image::RgbImage) -> Self {
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let mut pixels = Array3::<f32>::zeros((height, width, 3));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                pixels[[y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
            }
        }
        Self { pixels }
    }

    /// Wrap an existing H x W x 3 array
    pub fn from_array(pixels: Array3<f32>) -> Result<Self, TilingError> {
        let channels = pixels.dim().2;
        if channels != 3 {
            return Err(TilingError::InvalidChannels(channels));
        }
        Ok(Self { pixels })
    }

    /// Convert back to an 8-bit RGB buffer
    pub fn to_rgb8(&self) -> ::image::RgbImage {
        let (height, width, _) = self.pixels.dim();
        ::image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            ::image::Rgb([
                to_u8(self.pixels[[y, x, 0]]),
                to_u8(self.pixels[[y, x, 1]]),
                to_u8(self.pixels[[y, x, 2]]),
            ])
        })
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    /// Borrow the underlying samples
    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.pixels.view()
    }
}

fn to_u8(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}
