//! Turns raw input blobs into decoded pages with session-stable ids.
//!
//! A single raster image becomes one page. Multi-page containers (PDF, CBZ)
//! are split into ordered pages first. A bad input, or a bad entry inside a
//! container, is reported on its own and never fails its siblings.

mod mime;
mod pdf;

use image::ImageFormat;
use std::cmp::Ordering;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::page::{OriginalImage, Page, PageId};

pub use mime::{InputKind, resolve_kind, sniff_mime};

/// Resolution used when splitting documents into pages.
pub const DEFAULT_PDF_DPI: u32 = 200;

#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, mime: Option<&str>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.map(|value| value.to_string()),
            bytes,
        }
    }

    pub fn from_path(path: &Path, mime: Option<&str>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read input file: {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("input")
            .to_string();
        Ok(Self::new(name, mime, bytes))
    }
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub pages: Vec<Page>,
    pub failures: Vec<IngestError>,
}

#[derive(Debug)]
pub struct Ingestor {
    next_id: u64,
    pdf_dpi: u32,
}

impl Default for Ingestor {
    fn default() -> Self {
        Self::new(DEFAULT_PDF_DPI)
    }
}

impl Ingestor {
    pub fn new(pdf_dpi: u32) -> Self {
        Self {
            next_id: 1,
            pdf_dpi: pdf_dpi.max(150),
        }
    }

    fn allocate_id(&mut self) -> PageId {
        let id = PageId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn ingest(&mut self, files: Vec<InputFile>) -> IngestReport {
        let mut report = IngestReport::default();
        for file in files {
            let kind = match resolve_kind(file.mime.as_deref(), &file.bytes, &file.name) {
                Ok(kind) => kind,
                Err(err) => {
                    warn!("{}", err);
                    report.failures.push(err);
                    continue;
                }
            };
            match kind {
                InputKind::Raster(format) => {
                    match self.decode_page(&file.name, file.bytes, format) {
                        Ok(page) => report.pages.push(page),
                        Err(err) => {
                            warn!("{}", err);
                            report.failures.push(err);
                        }
                    }
                }
                InputKind::Pdf => self.ingest_pdf(&file, &mut report),
                InputKind::ComicArchive => self.ingest_archive(&file, &mut report),
            }
        }
        info!(
            "ingested {} page(s), {} failure(s)",
            report.pages.len(),
            report.failures.len()
        );
        report
    }

    fn decode_page(&mut self, label: &str, bytes: Vec<u8>, format: ImageFormat) -> Result<Page, IngestError> {
        let image = image::load_from_memory_with_format(&bytes, format).map_err(|err| {
            IngestError::DecodeError {
                label: label.to_string(),
                reason: err.to_string(),
            }
        })?;
        let bitmap = image.to_rgba8();
        if bitmap.width() == 0 || bitmap.height() == 0 {
            return Err(IngestError::DecodeError {
                label: label.to_string(),
                reason: "image has no pixels".to_string(),
            });
        }
        let id = self.allocate_id();
        debug!(
            "page {} from {} ({}x{})",
            id,
            label,
            bitmap.width(),
            bitmap.height()
        );
        Ok(Page::new(
            id,
            label,
            bitmap,
            OriginalImage {
                bytes: Arc::new(bytes),
                extension: mime::extension_for(format).to_string(),
            },
        ))
    }

    fn ingest_pdf(&mut self, file: &InputFile, report: &mut IngestReport) {
        let pages = match pdf::render_pdf_pages(&file.bytes, self.pdf_dpi) {
            Ok(pages) => pages,
            Err(err) => {
                let err = IngestError::DecodeError {
                    label: file.name.clone(),
                    reason: format!("{:#}", err),
                };
                warn!("{}", err);
                report.failures.push(err);
                return;
            }
        };
        if pages.is_empty() {
            report.failures.push(IngestError::DecodeError {
                label: file.name.clone(),
                reason: "no pages found in pdf".to_string(),
            });
            return;
        }
        for (index, bytes) in pages.into_iter().enumerate() {
            let label = format!("{}#page{}", file.name, index + 1);
            match self.decode_page(&label, bytes, ImageFormat::Png) {
                Ok(page) => report.pages.push(page),
                Err(err) => {
                    warn!("{}", err);
                    report.failures.push(err);
                }
            }
        }
    }

    fn ingest_archive(&mut self, file: &InputFile, report: &mut IngestReport) {
        let mut archive = match zip::ZipArchive::new(Cursor::new(file.bytes.as_slice())) {
            Ok(archive) => archive,
            Err(err) => {
                report.failures.push(IngestError::DecodeError {
                    label: file.name.clone(),
                    reason: format!("failed to read zip archive: {}", err),
                });
                return;
            }
        };

        let mut entries = Vec::new();
        for index in 0..archive.len() {
            let Ok(entry) = archive.by_index(index) else {
                continue;
            };
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if is_hidden_entry(&name) {
                continue;
            }
            if let Some(format) = mime::image_format_from_name(&name) {
                entries.push((index, name, format));
            }
        }
        entries.sort_by(|a, b| natural_cmp(&a.1, &b.1));
        if entries.is_empty() {
            report.failures.push(IngestError::DecodeError {
                label: file.name.clone(),
                reason: "archive contains no images".to_string(),
            });
            return;
        }

        for (index, name, format) in entries {
            let label = format!("{}/{}", file.name, name);
            let mut bytes = Vec::new();
            let read = archive
                .by_index(index)
                .map_err(|err| err.to_string())
                .and_then(|mut entry| entry.read_to_end(&mut bytes).map_err(|err| err.to_string()));
            if let Err(reason) = read {
                report
                    .failures
                    .push(IngestError::DecodeError { label, reason });
                continue;
            }
            match self.decode_page(&label, bytes, format) {
                Ok(page) => report.pages.push(page),
                Err(err) => {
                    warn!("{}", err);
                    report.failures.push(err);
                }
            }
        }
    }
}

fn is_hidden_entry(name: &str) -> bool {
    name.starts_with("__MACOSX/")
        || name
            .rsplit('/')
            .next()
            .map(|base| base.starts_with('.'))
            .unwrap_or(false)
}

/// Orders names so that `page2` sorts before `page10`.
pub(crate) fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let lnum = take_number(&mut left);
                let rnum = take_number(&mut right);
                let ord = lnum
                    .trim_start_matches('0')
                    .len()
                    .cmp(&rnum.trim_start_matches('0').len())
                    .then_with(|| lnum.trim_start_matches('0').cmp(rnum.trim_start_matches('0')));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_number<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) -> String {
    let mut digits = String::new();
    while let Some(ch) = chars.peek().copied() {
        if !ch.is_ascii_digit() {
            break;
        }
        digits.push(ch);
        chars.next();
    }
    digits
}
