//! Composite artifact rendering
//!
//! Layout, left to right: source image, color-mapped enhanced prediction
//! with an inset legend, vertical colorbar with tick values and an axis
//! label. Both panels carry a title.

use std::io::Cursor;

use ab_glyph::FontRef;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use storage::{ArtifactRef, ArtifactStore};
use tiling::Image;
use tracing::{debug, info};
use uuid::Uuid;

use crate::colormap::reds;
use crate::{EnhancedMap, RenderError};

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const TICK_LENGTH: u32 = 6;
const TICKS: u32 = 4;

const SOURCE_TITLE: &str = "Imagen original";
const HEATMAP_TITLE: &str = "Predicción (realce asimétrico)";
const COLORBAR_LABEL: &str = "Probabilidad de nitruro";
const LEGEND_LABELS: [&str; 2] = ["Fondo", "Nitruro"];

static FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Rendering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Panels are downscaled so their longest side fits this
    pub max_panel_side: u32,
    /// 1.0 shows only the heatmap, 0.0 only the source image
    pub heatmap_opacity: f32,
    /// Outer margin and gap between panels, in pixels
    pub margin: u32,
    /// Colorbar width in pixels
    pub colorbar_width: u32,
    /// Text height in pixels
    pub font_size: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_panel_side: 1024,
            heatmap_opacity: 1.0,
            margin: 16,
            colorbar_width: 18,
            font_size: 14.0,
        }
    }
}

/// Pixel positions of every element on the canvas
#[derive(Debug, Clone, Copy, PartialEq)]
struct Layout {
    panel_height: u32,
    panel_y: u32,
    source_x: u32,
    heat_x: u32,
    bar_x: u32,
    bar_width: u32,
    tick_label_x: u32,
    axis_label_x: u32,
    canvas_width: u32,
    canvas_height: u32,
}

/// Renders and persists prediction artifacts
#[derive(Debug, Clone, Default)]
pub struct ArtifactRenderer {
    config: RenderConfig,
}

impl ArtifactRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    /// Fresh artifact name with a 128-bit random component
    pub fn artifact_name() -> String {
        format!("output_image_enhanced_{}.png", Uuid::new_v4().simple())
    }

    /// Render the composite and store it under a new unique name
    pub fn persist(
        &self,
        image: &Image,
        map: &EnhancedMap,
        store: &dyn ArtifactStore,
    ) -> Result<ArtifactRef, RenderError> {
        let png = self.render_png(image, map)?;
        let artifact = store.put(&Self::artifact_name(), &png)?;
        info!("Saved prediction artifact {} ({} bytes)", artifact.name, png.len());
        Ok(artifact)
    }

    /// Render the composite as PNG bytes
    pub fn render_png(&self, image: &Image, map: &EnhancedMap) -> Result<Vec<u8>, RenderError> {
        let canvas = self.compose(image, map)?;
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| RenderError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Build the composite canvas
    pub fn compose(&self, image: &Image, map: &EnhancedMap) -> Result<RgbImage, RenderError> {
        if map.height() == 0 || map.width() == 0 {
            return Err(RenderError::EmptyMap);
        }
        if map.height() != image.height() || map.width() != image.width() {
            return Err(RenderError::ShapeMismatch {
                map_height: map.height(),
                map_width: map.width(),
                image_height: image.height(),
                image_width: image.width(),
            });
        }

        let font = load_font()?;
        let source = image.to_rgb8();
        let heatmap = self.heatmap(&source, map);
        let (pw, ph) = self.panel_size(source.width(), source.height());
        let (source, heatmap) = if (pw, ph) != (source.width(), source.height()) {
            (
                imageops::resize(&source, pw, ph, FilterType::Triangle),
                imageops::resize(&heatmap, pw, ph, FilterType::Triangle),
            )
        } else {
            (source, heatmap)
        };

        let axis_label = self.axis_label(&font);
        let layout = self.layout(&font, pw, ph, &axis_label);
        let mut canvas = RgbImage::from_pixel(layout.canvas_width, layout.canvas_height, WHITE);

        let m = self.config.margin;
        self.draw_title(&mut canvas, &font, SOURCE_TITLE, layout.source_x, m, pw);
        self.draw_title(&mut canvas, &font, HEATMAP_TITLE, layout.heat_x, m, pw);
        imageops::replace(&mut canvas, &source, layout.source_x as i64, layout.panel_y as i64);
        imageops::replace(&mut canvas, &heatmap, layout.heat_x as i64, layout.panel_y as i64);
        self.draw_legend(&mut canvas, &font, layout.heat_x, layout.panel_y, pw, ph);
        self.draw_colorbar(&mut canvas, &font, &layout);

        let label_y = layout.panel_y + ph.saturating_sub(axis_label.height()) / 2;
        imageops::replace(&mut canvas, &axis_label, layout.axis_label_x as i64, label_y as i64);

        debug!(
            width = layout.canvas_width,
            height = layout.canvas_height,
            "Composed artifact from {}x{} map",
            map.height(),
            map.width()
        );
        Ok(canvas)
    }

    fn layout(&self, font: &FontRef<'_>, pw: u32, ph: u32, axis_label: &RgbImage) -> Layout {
        let m = self.config.margin;
        let scale = self.text_scale();
        let title_height = scale.ceil() as u32 + m / 2;
        let bar_width = self.config.colorbar_width.max(1);
        let (tick_label_width, _) = text_size(scale, font, "0.00");

        let panel_y = m + title_height;
        let heat_x = m + pw + m;
        let bar_x = heat_x + pw + m / 2;
        let tick_label_x = bar_x + bar_width + TICK_LENGTH + 2;
        let axis_label_x = tick_label_x + tick_label_width + m / 2;

        Layout {
            panel_height: ph,
            panel_y,
            source_x: m,
            heat_x,
            bar_x,
            bar_width,
            tick_label_x,
            axis_label_x,
            canvas_width: axis_label_x + axis_label.width() + m,
            canvas_height: panel_y + ph.max(axis_label.height()) + m,
        }
    }

    fn text_scale(&self) -> f32 {
        self.config.font_size.max(6.0)
    }

    fn panel_size(&self, width: u32, height: u32) -> (u32, u32) {
        let longest = width.max(height);
        let max_side = self.config.max_panel_side.max(1);
        if longest <= max_side {
            return (width, height);
        }
        let scale = max_side as f32 / longest as f32;
        (
            ((width as f32 * scale).round() as u32).max(1),
            ((height as f32 * scale).round() as u32).max(1),
        )
    }

    fn heatmap(&self, source: &RgbImage, map: &EnhancedMap) -> RgbImage {
        let alpha = self.config.heatmap_opacity.clamp(0.0, 1.0);
        let values = map.view();
        RgbImage::from_fn(source.width(), source.height(), |x, y| {
            let heat = reds(values[[y as usize, x as usize]]);
            let base = source.get_pixel(x, y);
            Rgb([
                blend(heat[0], base[0], alpha),
                blend(heat[1], base[1], alpha),
                blend(heat[2], base[2], alpha),
            ])
        })
    }

    /// Title centered over a panel, shrunk to the panel width if needed
    fn draw_title(&self, canvas: &mut RgbImage, font: &FontRef<'_>, text: &str, x: u32, y: u32, width: u32) {
        let mut scale = self.text_scale();
        let (text_width, _) = text_size(scale, font, text);
        if text_width > width {
            scale *= width as f32 / text_width as f32;
        }
        let (text_width, _) = text_size(scale, font, text);
        let offset = width.saturating_sub(text_width) / 2;
        draw_text_mut(canvas, BLACK, (x + offset) as i32, y as i32, scale, font, text);
    }

    /// Colorbar label rendered horizontally, then turned to read bottom to top
    fn axis_label(&self, font: &FontRef<'_>) -> RgbImage {
        let scale = self.text_scale();
        let (width, height) = text_size(scale, font, COLORBAR_LABEL);
        let mut label = RgbImage::from_pixel(width + 2, height + 4, WHITE);
        draw_text_mut(&mut label, BLACK, 1, 0, scale, font, COLORBAR_LABEL);
        imageops::rotate270(&label)
    }

    fn draw_colorbar(&self, canvas: &mut RgbImage, font: &FontRef<'_>, layout: &Layout) {
        let (x, y) = (layout.bar_x, layout.panel_y);
        let (width, height) = (layout.bar_width, layout.panel_height);
        let span = height.saturating_sub(1).max(1) as f32;
        for row in 0..height {
            let color = reds(1.0 - row as f32 / span);
            draw_filled_rect_mut(canvas, Rect::at(x as i32, (y + row) as i32).of_size(width, 1), color);
        }
        draw_hollow_rect_mut(
            canvas,
            Rect::at(x as i32 - 1, y as i32 - 1).of_size(width + 2, height + 2),
            BLACK,
        );

        let scale = self.text_scale();
        let right = (x + width) as f32;
        for tick in 0..=TICKS {
            let value = tick as f32 / TICKS as f32;
            let ty = y as f32 + (1.0 - value) * span;
            draw_line_segment_mut(canvas, (right, ty), (right + TICK_LENGTH as f32, ty), BLACK);

            let text = format!("{:.2}", value);
            let (_, text_height) = text_size(scale, font, &text);
            let text_y = ty as i32 - text_height as i32 / 2;
            draw_text_mut(canvas, BLACK, layout.tick_label_x as i32, text_y, scale, font, &text);
        }
    }

    /// Labeled background and foreground swatches in the panel's lower-right corner
    fn draw_legend(
        &self,
        canvas: &mut RgbImage,
        font: &FontRef<'_>,
        panel_x: u32,
        panel_y: u32,
        width: u32,
        height: u32,
    ) {
        let scale = self.text_scale();
        let swatch = (scale.ceil() as u32).max(6);
        let pad = (swatch / 2).max(3);
        let label_width = LEGEND_LABELS
            .iter()
            .map(|label| text_size(scale, font, label).0)
            .max()
            .unwrap_or(0);
        let box_w = swatch + label_width + 3 * pad;
        let box_h = 2 * swatch + 3 * pad;
        if box_w + pad > width || box_h + pad > height {
            return;
        }

        let x = panel_x + width - box_w - pad;
        let y = panel_y + height - box_h - pad;
        let frame = Rect::at(x as i32, y as i32).of_size(box_w, box_h);
        draw_filled_rect_mut(canvas, frame, WHITE);
        draw_hollow_rect_mut(canvas, frame, BLACK);

        let swatches = [reds(0.0), reds(1.0)];
        for (i, (color, label)) in swatches.into_iter().zip(LEGEND_LABELS).enumerate() {
            let sy = y + pad + i as u32 * (swatch + pad);
            let rect = Rect::at((x + pad) as i32, sy as i32).of_size(swatch, swatch);
            draw_filled_rect_mut(canvas, rect, color);
            draw_hollow_rect_mut(canvas, rect, BLACK);
            draw_text_mut(canvas, BLACK, (x + 2 * pad + swatch) as i32, sy as i32, scale, font, label);
        }
    }
}

fn load_font() -> Result<FontRef<'static>, RenderError> {
    FontRef::try_from_slice(FONT_DATA).map_err(|e| RenderError::Font(e.to_string()))
}

fn blend(top: u8, bottom: u8, alpha: f32) -> u8 {
    (top as f32 * alpha + bottom as f32 * (1.0 - alpha)).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Enhancer;
    use ndarray::{Array2, Array3};
    use storage::{FsArtifactStore, MediaConfig};
    use tiling::ProbabilityMap;

    fn fixture(height: usize, width: usize) -> (Image, EnhancedMap) {
        let image = Image::from_array(Array3::from_elem((height, width, 3), 0.5)).unwrap();
        let probs = Array2::from_shape_fn((height, width), |(_, x)| x as f32 / width as f32);
        let map = Enhancer::default().enhance(&ProbabilityMap::from_array(probs));
        (image, map)
    }

    fn layout_for(renderer: &ArtifactRenderer, pw: u32, ph: u32) -> Layout {
        let font = load_font().unwrap();
        let label = renderer.axis_label(&font);
        renderer.layout(&font, pw, ph, &label)
    }

    fn has_ink(canvas: &RgbImage, x: u32, y: u32, width: u32, height: u32) -> bool {
        (y..y + height).any(|py| (x..x + width).any(|px| canvas.get_pixel(px, py).0[0] < 128))
    }

    #[test]
    fn test_canvas_layout() {
        let (image, map) = fixture(40, 60);
        let renderer = ArtifactRenderer::default();
        let canvas = renderer.compose(&image, &map).unwrap();
        let layout = layout_for(&renderer, 60, 40);

        assert_eq!(canvas.width(), layout.canvas_width);
        assert_eq!(canvas.height(), layout.canvas_height);
        assert_eq!(layout.heat_x, 16 + 60 + 16);
        assert!(layout.panel_y > 16);
        // Source panel keeps its gray
        assert_eq!(canvas.get_pixel(layout.source_x + 1, layout.panel_y + 1).0, [128, 128, 128]);
        // Left edge of the heatmap panel is the palette's lightest color
        assert_eq!(*canvas.get_pixel(layout.heat_x, layout.panel_y + 1), reds(0.0));
    }

    #[test]
    fn test_text_drawn() {
        let (image, map) = fixture(200, 240);
        let renderer = ArtifactRenderer::default();
        let canvas = renderer.compose(&image, &map).unwrap();
        let layout = layout_for(&renderer, 240, 200);

        // Panel titles
        let title_height = layout.panel_y - 16;
        assert!(has_ink(&canvas, layout.source_x, 16, 240, title_height));
        assert!(has_ink(&canvas, layout.heat_x, 16, 240, title_height));
        // Tick values beside the colorbar
        let tick_width = layout.axis_label_x - layout.tick_label_x;
        assert!(has_ink(&canvas, layout.tick_label_x, layout.panel_y, tick_width, 200));
        // Rotated axis label
        let label_width = layout.canvas_width - layout.axis_label_x - 16;
        assert!(has_ink(&canvas, layout.axis_label_x, layout.panel_y, label_width, 200));
    }

    #[test]
    fn test_legend_is_labeled() {
        let (image, map) = fixture(200, 240);
        let renderer = ArtifactRenderer::default();
        let canvas = renderer.compose(&image, &map).unwrap();
        let layout = layout_for(&renderer, 240, 200);

        let font = load_font().unwrap();
        let label_width = LEGEND_LABELS
            .iter()
            .map(|label| text_size(14.0, &font, label).0)
            .max()
            .unwrap();
        let (swatch, pad) = (14, 7);
        let box_x = layout.heat_x + 240 - (swatch + label_width + 3 * pad) - pad;
        let first_row = layout.panel_y + 200 - (2 * swatch + 3 * pad) - pad + pad;

        let text_x = box_x + 2 * pad + swatch;
        assert!(has_ink(&canvas, text_x, first_row, label_width, swatch));
        // Background swatch itself stays light inside its border
        assert!(!has_ink(&canvas, box_x + pad + 2, first_row + 2, swatch - 4, swatch - 4));
    }

    #[test]
    fn test_large_panels_downscaled() {
        let (image, map) = fixture(100, 400);
        let renderer = ArtifactRenderer::new(RenderConfig {
            max_panel_side: 200,
            ..Default::default()
        });
        let canvas = renderer.compose(&image, &map).unwrap();
        let layout = layout_for(&renderer, 200, 50);
        assert_eq!(layout.panel_height, 50);
        assert_eq!(canvas.width(), layout.canvas_width);
        assert_eq!(canvas.height(), layout.canvas_height);
    }

    #[test]
    fn test_zero_opacity_shows_source() {
        let (image, map) = fixture(20, 20);
        let renderer = ArtifactRenderer::new(RenderConfig {
            heatmap_opacity: 0.0,
            ..Default::default()
        });
        let canvas = renderer.compose(&image, &map).unwrap();
        let layout = layout_for(&renderer, 20, 20);
        assert_eq!(canvas.get_pixel(layout.heat_x + 1, layout.panel_y + 1).0, [128, 128, 128]);
    }

    #[test]
    fn test_mismatched_map_rejected() {
        let (image, _) = fixture(20, 20);
        let (_, map) = fixture(10, 20);
        let result = ArtifactRenderer::default().compose(&image, &map);
        assert!(matches!(result, Err(RenderError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_png_decodes() {
        let (image, map) = fixture(24, 32);
        let renderer = ArtifactRenderer::default();
        let png = renderer.render_png(&image, &map).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.height(), layout_for(&renderer, 32, 24).canvas_height);
    }

    #[test]
    fn test_persist_uses_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(MediaConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let (image, map) = fixture(24, 24);
        let renderer = ArtifactRenderer::default();

        let first = renderer.persist(&image, &map, &store).unwrap();
        let second = renderer.persist(&image, &map, &store).unwrap();

        assert_ne!(first.name, second.name);
        assert!(first.name.starts_with("output_image_enhanced_"));
        assert!(first.url.starts_with("https://"));
        assert!(dir.path().join(&first.name).is_file());
    }
}
