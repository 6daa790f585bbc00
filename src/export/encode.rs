use anyhow::{Context, Result};
use image::codecs::png::{CompressionType, FilterType, PngEncoder as ImagePngEncoder};
use image::{ExtendedColorType, ImageEncoder, RgbaImage};

/// Turns a rendered page into file bytes.
pub trait PageEncoder: Send + Sync {
    fn extension(&self) -> &str;

    /// `quality` is in `[0, 1]`.
    fn encode(&self, image: &RgbaImage, quality: f32) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PngEncoder;

impl PageEncoder for PngEncoder {
    fn extension(&self) -> &str {
        "png"
    }

    fn encode(&self, image: &RgbaImage, quality: f32) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let encoder =
            ImagePngEncoder::new_with_quality(&mut bytes, png_compression(quality), FilterType::Adaptive);
        encoder
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgba8,
            )
            .with_context(|| "failed to encode png")?;
        Ok(bytes)
    }
}

pub(crate) fn png_compression(quality: f32) -> CompressionType {
    let quality = clamp_quality(quality);
    if quality < 0.34 {
        CompressionType::Fast
    } else if quality < 0.67 {
        CompressionType::Default
    } else {
        CompressionType::Best
    }
}

pub(crate) fn clamp_quality(quality: f32) -> f32 {
    if quality.is_finite() {
        quality.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_maps_to_compression() {
        assert!(matches!(png_compression(0.0), CompressionType::Fast));
        assert!(matches!(png_compression(0.5), CompressionType::Default));
        assert!(matches!(png_compression(0.9), CompressionType::Best));
        assert!(matches!(png_compression(f32::NAN), CompressionType::Best));
        assert!(matches!(png_compression(-3.0), CompressionType::Fast));
    }

    #[test]
    fn encodes_a_decodable_png() {
        let image = RgbaImage::from_pixel(3, 2, image::Rgba([1, 2, 3, 255]));
        let bytes = PngEncoder.encode(&image, 0.5).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded, image);
    }
}
