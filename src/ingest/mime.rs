use image::ImageFormat;

use crate::error::IngestError;

pub const PDF_MIME: &str = "application/pdf";
pub const ZIP_MIME: &str = "application/zip";
pub const CBZ_MIME: &str = "application/vnd.comicbook+zip";
pub const OCTET_STREAM_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Raster(ImageFormat),
    Pdf,
    ComicArchive,
}

/// Resolves the declared mime (or sniffs the bytes when it is `auto`, empty or
/// `application/octet-stream`) into something ingestion can split or decode.
pub fn resolve_kind(declared: Option<&str>, bytes: &[u8], label: &str) -> Result<InputKind, IngestError> {
    let raw = declared.unwrap_or("auto").trim().to_lowercase();
    let mime = match raw.as_str() {
        "" | "auto" | OCTET_STREAM_MIME => sniff_mime(bytes)
            .or_else(|| mime_from_name(label))
            .ok_or_else(|| IngestError::UnsupportedFormat {
                label: label.to_string(),
                mime: if raw.is_empty() { "auto".to_string() } else { raw.clone() },
            })?,
        other => alias_mime(other).unwrap_or(other).to_string(),
    };
    kind_from_mime(&mime).ok_or_else(|| IngestError::UnsupportedFormat {
        label: label.to_string(),
        mime,
    })
}

pub fn sniff_mime(bytes: &[u8]) -> Option<String> {
    infer::get(bytes).map(|kind| kind.mime_type().to_string())
}

fn mime_from_name(name: &str) -> Option<String> {
    let ext = name.rsplit_once('.')?.1.to_lowercase();
    alias_mime(&ext).map(|mime| mime.to_string())
}

fn alias_mime(value: &str) -> Option<&'static str> {
    match value {
        "png" => Some("image/png"),
        "jpg" | "jpeg" | "image/jpg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        "pdf" => Some(PDF_MIME),
        "zip" | "application/x-zip-compressed" => Some(ZIP_MIME),
        "cbz" | "application/x-cbz" => Some(CBZ_MIME),
        _ => None,
    }
}

fn kind_from_mime(mime: &str) -> Option<InputKind> {
    match mime {
        PDF_MIME => Some(InputKind::Pdf),
        ZIP_MIME | CBZ_MIME => Some(InputKind::ComicArchive),
        _ => image_format_from_mime(mime).map(InputKind::Raster),
    }
}

pub fn image_format_from_mime(mime: &str) -> Option<ImageFormat> {
    match mime {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/gif" => Some(ImageFormat::Gif),
        "image/webp" => Some(ImageFormat::WebP),
        "image/bmp" => Some(ImageFormat::Bmp),
        "image/tiff" => Some(ImageFormat::Tiff),
        _ => None,
    }
}

pub fn image_format_from_name(name: &str) -> Option<ImageFormat> {
    mime_from_name(name).and_then(|mime| image_format_from_mime(&mime))
}

pub fn extension_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::Gif => "gif",
        ImageFormat::WebP => "webp",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[test]
    fn declared_image_mime_is_trusted() {
        assert_eq!(
            resolve_kind(Some("image/jpeg"), b"", "a").unwrap(),
            InputKind::Raster(ImageFormat::Jpeg)
        );
        assert_eq!(
            resolve_kind(Some("cbz"), b"", "a").unwrap(),
            InputKind::ComicArchive
        );
    }

    #[test]
    fn auto_mime_sniffs_content() {
        assert_eq!(
            resolve_kind(Some("auto"), PNG_MAGIC, "blob").unwrap(),
            InputKind::Raster(ImageFormat::Png)
        );
        assert_eq!(
            resolve_kind(None, b"not an image", "scan.pdf").unwrap(),
            InputKind::Pdf
        );
    }

    #[test]
    fn unknown_mime_is_unsupported() {
        let err = resolve_kind(Some("text/plain"), b"hello", "notes.txt").unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat { .. }));
        let err = resolve_kind(None, b"hello", "notes").unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat { .. }));
    }
}
