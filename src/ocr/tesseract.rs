use anyhow::{Context, Result, anyhow};
use image::{GrayImage, Luma, RgbaImage};
use std::io::Write;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::command::command_exists;
use crate::page::BBox;

use super::parse::parse_tsv_regions;
use super::{DetectedText, RecognitionBackend, Recognizer};

/// Sparse text, which suits speech bubbles scattered over a page.
pub const DEFAULT_PSM: u32 = 11;

/// Recognition through the `tesseract` command line tool.
#[derive(Debug, Clone)]
pub struct TesseractBackend {
    psm: u32,
}

impl TesseractBackend {
    pub fn new(psm: u32) -> Self {
        Self { psm }
    }
}

impl Default for TesseractBackend {
    fn default() -> Self {
        Self::new(DEFAULT_PSM)
    }
}

impl RecognitionBackend for TesseractBackend {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn load(&self, language: &str) -> Result<Arc<dyn Recognizer>> {
        if !command_exists("tesseract") {
            return Err(anyhow!("tesseract is not installed or not on PATH"));
        }
        let languages = normalize_ocr_languages(language)?;
        debug!("tesseract ready for '{}' (psm {})", languages, self.psm);
        Ok(Arc::new(TesseractRecognizer {
            languages,
            psm: self.psm,
        }))
    }
}

struct TesseractRecognizer {
    languages: String,
    psm: u32,
}

impl Recognizer for TesseractRecognizer {
    fn recognize(&self, image: &RgbaImage) -> Result<Vec<DetectedText>> {
        let scale = ocr_scale(image.width());
        let prepared = prepare_for_ocr(image, scale);

        let mut tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .with_context(|| "failed to create temp file for OCR")?;
        image::DynamicImage::ImageLuma8(prepared)
            .write_to(&mut tmp, image::ImageFormat::Png)
            .with_context(|| "failed to write temp image for OCR")?;
        tmp.flush().ok();

        let tsv = run_tesseract_tsv(tmp.path(), &self.languages, self.psm)?;
        let mut regions = parse_tsv_regions(&tsv);
        if scale > 1 {
            for region in &mut regions {
                region.bbox = unscale_bbox(region.bbox, scale);
            }
        }
        Ok(regions)
    }
}

pub fn list_tesseract_languages() -> Result<Vec<String>> {
    let output = Command::new("tesseract")
        .arg("--list-langs")
        .output()
        .with_context(|| "failed to run tesseract --list-langs")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract --list-langs failed: {}", stderr.trim()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect())
}

/// Keeps the installed subset of a `jpn+eng` style language list.
fn normalize_ocr_languages(requested: &str) -> Result<String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("ocr language is empty"));
    }
    let available = match list_tesseract_languages() {
        Ok(list) => list,
        Err(_) => return Ok(trimmed.to_string()),
    };
    select_languages(trimmed, &available)
}

fn select_languages(requested: &str, available: &[String]) -> Result<String> {
    let (chosen, missing): (Vec<&str>, Vec<&str>) = requested
        .split(['+', ',', ' '])
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .partition(|lang| available.iter().any(|value| value == lang));

    if chosen.is_empty() {
        return Err(anyhow!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        ));
    }
    if !missing.is_empty() {
        warn!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        );
    }
    Ok(chosen.join("+"))
}

fn run_tesseract_tsv(path: &std::path::Path, languages: &str, psm: u32) -> Result<String> {
    let output = Command::new("tesseract")
        .arg(path)
        .arg("stdout")
        .arg("-l")
        .arg(languages)
        .arg("--oem")
        .arg("1")
        .arg("--psm")
        .arg(psm.to_string())
        .arg("--dpi")
        .arg("300")
        .arg("tsv")
        .output()
        .with_context(|| "failed to run tesseract")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract failed: {}", stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Upscale factor for small scans; capped so the scaled width stays under 6000 px.
fn ocr_scale(width: u32) -> u32 {
    let max_width = 6000u32;
    let mut scale = 3u32;
    while width.saturating_mul(scale) > max_width && scale > 1 {
        scale -= 1;
    }
    scale
}

/// Flattens alpha onto white, converts to luma, upscales and stretches contrast.
fn prepare_for_ocr(image: &RgbaImage, scale: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut luma = GrayImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as f32 / 255.0;
        let flatten = |channel: u8| channel as f32 * alpha + 255.0 * (1.0 - alpha);
        let value = 0.299 * flatten(r) + 0.587 * flatten(g) + 0.114 * flatten(b);
        luma.put_pixel(x, y, Luma([value.round() as u8]));
    }

    let resized = if scale > 1 {
        image::imageops::resize(
            &luma,
            width.saturating_mul(scale),
            height.saturating_mul(scale),
            image::imageops::FilterType::Lanczos3,
        )
    } else {
        luma
    };
    contrast_stretch(resized)
}

fn contrast_stretch(mut image: GrayImage) -> GrayImage {
    let (min, max) = image
        .pixels()
        .fold((255u8, 0u8), |(lo, hi), pixel| (lo.min(pixel[0]), hi.max(pixel[0])));
    if max <= min {
        return image;
    }
    let scale = 255.0 / (max as f32 - min as f32);
    for pixel in image.pixels_mut() {
        pixel[0] = (pixel[0].saturating_sub(min) as f32 * scale).round() as u8;
    }
    image
}

fn unscale_bbox(bbox: BBox, scale: u32) -> BBox {
    let x = bbox.x / scale;
    let y = bbox.y / scale;
    let right = bbox.right().div_ceil(scale);
    let bottom = bbox.bottom().div_ceil(scale);
    BBox::new(x, y, right - x, bottom - y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_shrinks_for_wide_pages() {
        assert_eq!(ocr_scale(800), 3);
        assert_eq!(ocr_scale(2500), 2);
        assert_eq!(ocr_scale(7000), 1);
    }

    #[test]
    fn unscaled_boxes_cover_the_original_area() {
        assert_eq!(unscale_bbox(BBox::new(31, 30, 61, 60), 3), BBox::new(10, 10, 21, 20));
    }

    #[test]
    fn keeps_installed_languages_only() {
        let available = vec!["eng".to_string(), "jpn".to_string()];
        assert_eq!(select_languages("jpn+kor+eng", &available).unwrap(), "jpn+eng");
        assert!(select_languages("kor", &available).is_err());
    }

    #[test]
    fn preparation_stretches_contrast() {
        let mut image = RgbaImage::from_pixel(2, 1, image::Rgba([100, 100, 100, 255]));
        image.put_pixel(1, 0, image::Rgba([200, 200, 200, 255]));
        let prepared = prepare_for_ocr(&image, 1);
        assert_eq!(prepared.get_pixel(0, 0)[0], 0);
        assert_eq!(prepared.get_pixel(1, 0)[0], 255);
    }
}
