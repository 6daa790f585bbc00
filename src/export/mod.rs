//! Writes rendered pages either as individual files or as one zip archive.
//! A page that cannot be rendered or encoded is recorded and skipped.

mod encode;

use anyhow::{Context, Result};
use image::RgbaImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zip::ZipWriter;
use zip::write::FileOptions;

use crate::error::ExportError;
use crate::page::{OriginalImage, PageId, PageStatus, TextRegion};
use crate::render::OverlayRenderer;
use crate::style::StyleConfig;

pub use encode::{PageEncoder, PngEncoder};

pub const ARCHIVE_NAME: &str = "translated_manga.zip";
const ORIGINAL_DIR: &str = "original";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    PerImage,
    #[default]
    Archive,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per-image" | "images" => Ok(ExportFormat::PerImage),
            "archive" | "zip" => Ok(ExportFormat::Archive),
            other => Err(format!("unknown export format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub quality: f32,
    pub include_original: bool,
}

impl Default for ExportRequest {
    fn default() -> Self {
        Self {
            format: ExportFormat::Archive,
            quality: 0.9,
            include_original: false,
        }
    }
}

/// One page as handed to the packager. `position` is 1-indexed in the batch.
#[derive(Debug, Clone)]
pub struct ExportItem {
    pub page_id: PageId,
    pub position: usize,
    pub status: PageStatus,
    pub source: Arc<RgbaImage>,
    pub regions: Vec<TextRegion>,
    /// Render already valid for the current style, if any.
    pub cached: Option<Arc<RgbaImage>>,
    pub original: OriginalImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportOutcome {
    Complete,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportFailure {
    pub page_id: PageId,
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub outcome: ExportOutcome,
    /// Files on disk: the archive, or every written image.
    pub files: Vec<PathBuf>,
    pub exported: Vec<PageId>,
    pub failures: Vec<ExportFailure>,
}

impl ExportReport {
    pub fn failed_pages(&self) -> Vec<PageId> {
        self.failures.iter().map(|failure| failure.page_id).collect()
    }
}

pub fn translated_name(position: usize, extension: &str) -> String {
    format!("translated_page_{}.{}", position, extension)
}

pub fn original_name(position: usize, extension: &str) -> String {
    format!("{}/original_page_{}.{}", ORIGINAL_DIR, position, extension)
}

struct EncodedPage {
    page_id: PageId,
    position: usize,
    bytes: Vec<u8>,
    original: Option<OriginalImage>,
}

pub struct ExportPackager {
    renderer: Arc<OverlayRenderer>,
    encoder: Box<dyn PageEncoder>,
    window: usize,
}

impl ExportPackager {
    pub fn new(renderer: Arc<OverlayRenderer>) -> Self {
        Self::with_encoder(renderer, Box::new(PngEncoder))
    }

    pub fn with_encoder(renderer: Arc<OverlayRenderer>, encoder: Box<dyn PageEncoder>) -> Self {
        Self {
            renderer,
            encoder,
            window: num_cpus::get().max(1),
        }
    }

    /// Number of pages rendered at once; caps peak memory.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn export(
        &self,
        items: &[ExportItem],
        request: &ExportRequest,
        style: &StyleConfig,
        output_dir: &Path,
    ) -> Result<ExportReport, ExportError> {
        if items.is_empty() {
            return Err(ExportError::PackagingError("no pages to export".to_string()));
        }
        fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))
            .map_err(packaging)?;

        let mut failures = Vec::new();
        let exportable = items
            .iter()
            .filter(|item| {
                if item.status.has_regions() {
                    return true;
                }
                let err = ExportError::NotExportable {
                    page_id: item.page_id,
                    status: item.status,
                };
                warn!("{}", err);
                failures.push(failure(item, &err));
                false
            })
            .collect::<Vec<_>>();

        let mut sink = match request.format {
            ExportFormat::PerImage => Sink::Directory {
                dir: output_dir.to_path_buf(),
                written: Vec::new(),
            },
            ExportFormat::Archive => Sink::archive(output_dir)?,
        };

        let mut exported = Vec::new();
        for window in exportable.chunks(self.window) {
            let encoded = window
                .par_iter()
                .map(|item| self.encode_item(item, request, style))
                .collect::<Vec<_>>();
            for (item, result) in window.iter().zip(encoded) {
                let page = match result {
                    Ok(page) => page,
                    Err(err) => {
                        warn!("{}", err);
                        failures.push(failure(item, &err));
                        continue;
                    }
                };
                match sink.write(&page, self.encoder.extension()) {
                    Ok(()) => exported.push(page.page_id),
                    // a broken archive cannot hold the remaining pages
                    Err(err @ ExportError::PackagingError(_)) => return Err(err),
                    Err(err) => {
                        warn!("{}", err);
                        failures.push(failure(item, &err));
                    }
                }
            }
            debug!("exported window of {} page(s)", window.len());
        }

        failures.sort_by_key(|failure| failure.position);
        if exported.is_empty() {
            // drops the unfinished archive temp file
            drop(sink);
            return Err(ExportError::PackagingError(format!(
                "none of {} page(s) could be exported",
                items.len()
            )));
        }
        let files = sink.finish()?;
        let outcome = if failures.is_empty() {
            ExportOutcome::Complete
        } else {
            ExportOutcome::Partial
        };
        info!(
            "exported {} of {} page(s) to {}",
            exported.len(),
            items.len(),
            output_dir.display()
        );
        Ok(ExportReport {
            outcome,
            files,
            exported,
            failures,
        })
    }

    fn encode_item(
        &self,
        item: &ExportItem,
        request: &ExportRequest,
        style: &StyleConfig,
    ) -> Result<EncodedPage, ExportError> {
        let encode_error = |reason: String| ExportError::EncodeError {
            page_id: item.page_id,
            reason,
        };
        let rendered = match &item.cached {
            Some(bitmap) => Arc::clone(bitmap),
            None => {
                let output = self
                    .renderer
                    .render(&item.source, &item.regions, style)
                    .map_err(|err| encode_error(err.to_string()))?;
                Arc::new(output.image)
            }
        };
        let bytes = self
            .encoder
            .encode(&rendered, request.quality)
            .map_err(|err| encode_error(format!("{:#}", err)))?;
        Ok(EncodedPage {
            page_id: item.page_id,
            position: item.position,
            bytes,
            original: request.include_original.then(|| item.original.clone()),
        })
    }
}

fn failure(item: &ExportItem, err: &ExportError) -> ExportFailure {
    ExportFailure {
        page_id: item.page_id,
        position: item.position,
        reason: err.to_string(),
    }
}

fn packaging(err: anyhow::Error) -> ExportError {
    ExportError::PackagingError(format!("{:#}", err))
}

/// Stages every entry in a temp file beside its target, then moves them into
/// place. Files already moved are removed again if a later one fails.
fn write_together(dir: &Path, entries: &[(String, &[u8])]) -> Result<Vec<PathBuf>> {
    let mut staged = Vec::with_capacity(entries.len());
    for (name, bytes) in entries {
        let path = dir.join(name);
        let parent = path.parent().unwrap_or(dir);
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        let mut file = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to stage {}", path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        staged.push((file, path));
    }

    let mut placed: Vec<PathBuf> = Vec::with_capacity(staged.len());
    for (file, path) in staged {
        if let Err(err) = file.persist(&path) {
            for done in &placed {
                let _ = fs::remove_file(done);
            }
            return Err(err).with_context(|| format!("failed to write {}", path.display()));
        }
        placed.push(path);
    }
    Ok(placed)
}

enum Sink {
    Directory {
        dir: PathBuf,
        written: Vec<PathBuf>,
    },
    Archive {
        writer: ZipWriter<tempfile::NamedTempFile>,
        target: PathBuf,
    },
}

impl Sink {
    /// The archive is built in a temp file next to its target and moved into
    /// place on success.
    fn archive(output_dir: &Path) -> Result<Self, ExportError> {
        let file = tempfile::Builder::new()
            .prefix(".translated_manga")
            .suffix(".zip.part")
            .tempfile_in(output_dir)
            .with_context(|| format!("failed to create archive in {}", output_dir.display()))
            .map_err(packaging)?;
        Ok(Sink::Archive {
            writer: ZipWriter::new(file),
            target: output_dir.join(ARCHIVE_NAME),
        })
    }

    /// Writes the translated image and, when requested, the original. A page
    /// lands in a directory with all of its files or none of them. A failed
    /// archive entry leaves the archive unusable and is a packaging error.
    fn write(&mut self, page: &EncodedPage, extension: &str) -> Result<(), ExportError> {
        let mut entries = vec![(translated_name(page.position, extension), page.bytes.as_slice())];
        if let Some(original) = &page.original {
            entries.push((
                original_name(page.position, &original.extension),
                original.bytes.as_slice(),
            ));
        }
        match self {
            Sink::Directory { dir, written } => {
                let paths = write_together(dir, &entries).map_err(|err| ExportError::EncodeError {
                    page_id: page.page_id,
                    reason: format!("{:#}", err),
                })?;
                written.extend(paths);
            }
            Sink::Archive { writer, .. } => {
                let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
                for (name, bytes) in entries {
                    writer
                        .start_file(name.as_str(), options)
                        .with_context(|| format!("failed to add {} to zip", name))
                        .map_err(packaging)?;
                    writer
                        .write_all(bytes)
                        .with_context(|| format!("failed to write {} to zip", name))
                        .map_err(packaging)?;
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<PathBuf>, ExportError> {
        match self {
            Sink::Directory { written, .. } => Ok(written),
            Sink::Archive { mut writer, target } => {
                let file = writer
                    .finish()
                    .with_context(|| "failed to finish zip archive")
                    .map_err(packaging)?;
                file.persist(&target)
                    .with_context(|| format!("failed to write {}", target.display()))
                    .map_err(packaging)?;
                Ok(vec![target])
            }
        }
    }
}
