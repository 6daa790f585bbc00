//! Overlay compositor: erases each text region with the background color and
//! draws its translation on top. Output depends only on the source bitmap,
//! the regions and the style snapshot.

mod font;
mod layout;

use image::RgbaImage;
use serde::Serialize;
use std::fmt::Write as _;
use tiny_skia::{Color, IntSize, Paint, Pixmap, Rect, Transform};
use tracing::{debug, warn};
use usvg::{Options, Tree};

use crate::error::RenderError;
use crate::page::{BBox, TextRegion};
use crate::style::{HexColor, StyleConfig};

pub use font::{FontBook, FontMetrics};
pub use layout::{ClipRect, LINE_HEIGHT_RATIO, MIN_FONT_SIZE, SHRINK_STEP, TextLayout};

/// Boxes with a side at or below this are filled without feathering.
const FEATHER_MIN_SIDE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionLayout {
    pub region_id: u32,
    pub bbox: BBox,
    /// `None` when the region has no text to draw.
    pub text: Option<TextLayout>,
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub image: RgbaImage,
    pub layouts: Vec<RegionLayout>,
    pub issues: Vec<RenderError>,
}

pub struct OverlayRenderer {
    fonts: FontBook,
}

impl OverlayRenderer {
    pub fn new(fonts: FontBook) -> Self {
        Self { fonts }
    }

    /// Full-resolution render.
    pub fn render(
        &self,
        source: &RgbaImage,
        regions: &[TextRegion],
        style: &StyleConfig,
    ) -> Result<RenderOutput, RenderError> {
        let (width, height) = source.dimensions();
        self.render_at(source, regions, style, width, height)
    }

    /// Same layout as [`OverlayRenderer::render`], drawn so that the longer side
    /// is at most `max_dim` pixels.
    pub fn render_preview(
        &self,
        source: &RgbaImage,
        regions: &[TextRegion],
        style: &StyleConfig,
        max_dim: u32,
    ) -> Result<RenderOutput, RenderError> {
        let (width, height) = preview_size(source.width(), source.height(), max_dim);
        self.render_at(source, regions, style, width, height)
    }

    /// Layout of one region in source pixels. The text is the region's
    /// `translated_text`, which is its source text until translated.
    pub fn layout_region(&self, region: &TextRegion, style: &StyleConfig) -> RegionLayout {
        let text = region.translated_text.trim();
        let text_layout = if text.is_empty() {
            None
        } else {
            let metrics = self.fonts.metrics_for(&style.font_family);
            Some(layout::layout_text(
                text,
                &region.bbox,
                style.font_size,
                |line, size| font::measure_text_width_px(line, size, metrics.as_ref()),
            ))
        };
        RegionLayout {
            region_id: region.id,
            bbox: region.bbox,
            text: text_layout,
        }
    }

    fn render_at(
        &self,
        source: &RgbaImage,
        regions: &[TextRegion],
        style: &StyleConfig,
        out_width: u32,
        out_height: u32,
    ) -> Result<RenderOutput, RenderError> {
        let (width, height) = source.dimensions();
        let base = if (out_width, out_height) == (width, height) {
            source.clone()
        } else {
            image::imageops::resize(
                source,
                out_width,
                out_height,
                image::imageops::FilterType::Triangle,
            )
        };
        let mut pixmap = pixmap_from_image(base)?;
        let transform = Transform::from_scale(
            out_width as f32 / width.max(1) as f32,
            out_height as f32 / height.max(1) as f32,
        );

        let mut layouts = Vec::with_capacity(regions.len());
        let mut issues = Vec::new();
        for region in regions {
            let Some(bbox) = region.bbox.clip_to(width, height) else {
                let issue = RenderError::RegionOutOfBounds {
                    region_id: region.id,
                    width,
                    height,
                };
                warn!("{}", issue);
                issues.push(issue);
                continue;
            };
            let clipped = TextRegion {
                bbox,
                ..region.clone()
            };
            fill_background(&mut pixmap, &bbox, style.background_color, transform);

            let layout = self.layout_region(&clipped, style);
            if let Some(text) = &layout.text
                && let Err(issue) = self.draw_text(&mut pixmap, &bbox, text, style, region.id, transform)
            {
                warn!("{}", issue);
                issues.push(issue);
            }
            layouts.push(layout);
        }
        debug!(
            "rendered {} region(s) at {}x{} ({} issue(s))",
            layouts.len(),
            out_width,
            out_height,
            issues.len()
        );

        Ok(RenderOutput {
            image: image_from_pixmap(pixmap)?,
            layouts,
            issues,
        })
    }

    fn draw_text(
        &self,
        pixmap: &mut Pixmap,
        bbox: &BBox,
        text: &TextLayout,
        style: &StyleConfig,
        region_id: u32,
        transform: Transform,
    ) -> Result<(), RenderError> {
        let svg = text_scene_svg(bbox, text, style, pixmap_source_size(pixmap, transform));
        let options = Options {
            fontdb: self.fonts.database(),
            ..Options::default()
        };
        let tree = Tree::from_str(&svg, &options).map_err(|err| RenderError::TextScene {
            region_id,
            reason: err.to_string(),
        })?;
        resvg::render(&tree, transform, &mut pixmap.as_mut());
        Ok(())
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(FontBook::default())
    }
}

pub(crate) fn preview_size(width: u32, height: u32, max_dim: u32) -> (u32, u32) {
    let longest = width.max(height);
    if max_dim == 0 || longest <= max_dim {
        return (width, height);
    }
    let scale = max_dim as f32 / longest as f32;
    (
        ((width as f32 * scale).round() as u32).max(1),
        ((height as f32 * scale).round() as u32).max(1),
    )
}

fn pixmap_source_size(pixmap: &Pixmap, transform: Transform) -> (f32, f32) {
    (
        pixmap.width() as f32 / transform.sx,
        pixmap.height() as f32 / transform.sy,
    )
}

/// Opaque core inset by 2px, then two 1px feather rings at 2/3 and 1/3 alpha.
fn fill_background(pixmap: &mut Pixmap, bbox: &BBox, color: HexColor, transform: Transform) {
    let x = bbox.x as f32;
    let y = bbox.y as f32;
    let w = bbox.width as f32;
    let h = bbox.height as f32;
    if bbox.width <= FEATHER_MIN_SIDE || bbox.height <= FEATHER_MIN_SIDE {
        fill(pixmap, x, y, w, h, color, 1.0, transform);
        return;
    }
    fill(pixmap, x + 2.0, y + 2.0, w - 4.0, h - 4.0, color, 1.0, transform);
    fill_ring(pixmap, x + 1.0, y + 1.0, w - 2.0, h - 2.0, color, 2.0 / 3.0, transform);
    fill_ring(pixmap, x, y, w, h, color, 1.0 / 3.0, transform);
}

/// The 1px frame just inside `x, y, w, h`.
#[allow(clippy::too_many_arguments)]
fn fill_ring(pixmap: &mut Pixmap, x: f32, y: f32, w: f32, h: f32, color: HexColor, alpha: f32, transform: Transform) {
    fill(pixmap, x, y, w, 1.0, color, alpha, transform);
    fill(pixmap, x, y + h - 1.0, w, 1.0, color, alpha, transform);
    fill(pixmap, x, y + 1.0, 1.0, h - 2.0, color, alpha, transform);
    fill(pixmap, x + w - 1.0, y + 1.0, 1.0, h - 2.0, color, alpha, transform);
}

#[allow(clippy::too_many_arguments)]
fn fill(pixmap: &mut Pixmap, x: f32, y: f32, w: f32, h: f32, color: HexColor, alpha: f32, transform: Transform) {
    let Some(rect) = Rect::from_xywh(x, y, w, h) else {
        return;
    };
    let mut paint = Paint::default();
    paint.anti_alias = false;
    let alpha = (color.opacity() * alpha).clamp(0.0, 1.0);
    paint.set_color(Color::from_rgba8(color.r, color.g, color.b, (alpha * 255.0).round() as u8));
    pixmap.fill_rect(rect, &paint, transform, None);
}

/// Standalone SVG with one clipped `<text>` block; drawn over the pixmap with
/// the same transform as the background fills.
fn text_scene_svg(bbox: &BBox, text: &TextLayout, style: &StyleConfig, size: (f32, f32)) -> String {
    let clip = text.clip;
    let center_x = bbox.x as f32 + bbox.width as f32 / 2.0;
    let top = bbox.y as f32 + (bbox.height as f32 - text.block_height()) / 2.0;
    let baseline_offset = (text.line_height - text.font_size) / 2.0 + text.font_size * 0.8;

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = size.0,
        h = size.1
    );
    let _ = write!(
        svg,
        r#"<clipPath id="region-clip"><rect x="{x}" y="{y}" width="{w}" height="{h}"/></clipPath>"#,
        x = clip.x,
        y = clip.y,
        w = clip.width,
        h = clip.height
    );

    let stroke = if style.stroke_width > 0.0 {
        format!(
            r#" stroke="{color}" stroke-opacity="{opacity}" stroke-width="{width}" stroke-linejoin="round" paint-order="stroke""#,
            color = style.stroke_color.svg_rgb(),
            opacity = style.stroke_color.opacity(),
            width = style.stroke_width * 2.0
        )
    } else {
        String::new()
    };
    let _ = write!(
        svg,
        r#"<g clip-path="url(#region-clip)"><text font-family="{family}, sans-serif" font-size="{size}" fill="{fill}" fill-opacity="{opacity}" text-anchor="middle"{stroke}>"#,
        family = escape_xml(&style.font_family),
        size = text.font_size,
        fill = style.text_color.svg_rgb(),
        opacity = style.text_color.opacity(),
        stroke = stroke
    );
    for (idx, line) in text.lines.iter().enumerate() {
        let _ = write!(
            svg,
            r#"<tspan x="{x}" y="{y}">{text}</tspan>"#,
            x = center_x,
            y = top + idx as f32 * text.line_height + baseline_offset,
            text = escape_xml(line)
        );
    }
    svg.push_str("</text></g></svg>");
    svg
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn pixmap_from_image(image: RgbaImage) -> Result<Pixmap, RenderError> {
    let (width, height) = image.dimensions();
    let size = IntSize::from_wh(width, height)
        .ok_or_else(|| RenderError::Bitmap(format!("invalid size {}x{}", width, height)))?;
    let mut data = image.into_raw();
    for px in data.chunks_exact_mut(4) {
        let a = px[3] as u32;
        if a < 255 {
            for channel in &mut px[..3] {
                *channel = ((*channel as u32 * a + 127) / 255) as u8;
            }
        }
    }
    Pixmap::from_vec(data, size).ok_or_else(|| RenderError::Bitmap("pixmap rejected page data".to_string()))
}

fn image_from_pixmap(pixmap: Pixmap) -> Result<RgbaImage, RenderError> {
    let (width, height) = (pixmap.width(), pixmap.height());
    let mut data = pixmap.take();
    for px in data.chunks_exact_mut(4) {
        let a = px[3] as u32;
        if a == 0 {
            px[..3].fill(0);
        } else if a < 255 {
            for channel in &mut px[..3] {
                *channel = ((*channel as u32 * 255 + a / 2) / a).min(255) as u8;
            }
        }
    }
    RgbaImage::from_raw(width, height, data)
        .ok_or_else(|| RenderError::Bitmap("rendered buffer has the wrong size".to_string()))
}
