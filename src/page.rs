use image::RgbaImage;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection with a `width`x`height` bitmap, `None` if nothing is left.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<BBox> {
        let x2 = self.right().min(width);
        let y2 = self.bottom().min(height);
        if self.x >= x2 || self.y >= y2 {
            return None;
        }
        Some(BBox::new(self.x, self.y, x2 - self.x, y2 - self.y))
    }

    pub(crate) fn vertical_overlap_ratio(&self, other: &BBox) -> f32 {
        let top = self.y.max(other.y);
        let bottom = self.bottom().min(other.bottom());
        if bottom <= top {
            return 0.0;
        }
        (bottom - top) as f32 / self.height.min(other.height).max(1) as f32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextRegion {
    pub id: u32,
    pub bbox: BBox,
    pub source_text: String,
    pub confidence: f32,
    pub translated_text: String,
    pub machine_translation: Option<String>,
    pub edited: bool,
    pub needs_review: bool,
}

impl TextRegion {
    pub fn new(id: u32, bbox: BBox, source_text: impl Into<String>, confidence: f32) -> Self {
        let source_text = source_text.into();
        Self {
            id,
            bbox,
            translated_text: source_text.clone(),
            source_text,
            confidence: confidence.clamp(0.0, 100.0),
            machine_translation: None,
            edited: false,
            needs_review: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Uploaded,
    Detecting,
    Detected,
    DetectionFailed,
    Translating,
    Translated,
    TranslationFailed,
    Rendered,
    Exported,
}

impl PageStatus {
    fn rank(self) -> u8 {
        match self {
            PageStatus::Uploaded => 0,
            PageStatus::Detecting => 1,
            PageStatus::Detected | PageStatus::DetectionFailed => 2,
            PageStatus::Translating => 3,
            PageStatus::Translated | PageStatus::TranslationFailed => 4,
            PageStatus::Rendered => 5,
            PageStatus::Exported => 6,
        }
    }

    /// Forward moves only; `DetectionFailed` is left only through a reset.
    pub fn can_transition(self, to: PageStatus) -> bool {
        if to == PageStatus::Uploaded {
            return true;
        }
        if self == PageStatus::DetectionFailed {
            return false;
        }
        if to == PageStatus::Exported && self == PageStatus::Exported {
            return true;
        }
        to.rank() > self.rank()
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            PageStatus::DetectionFailed | PageStatus::TranslationFailed
        )
    }

    /// Statuses in which regions exist and can be edited, rendered or exported.
    pub fn has_regions(self) -> bool {
        self.rank() >= 2 && self != PageStatus::DetectionFailed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageStatus::Uploaded => "uploaded",
            PageStatus::Detecting => "detecting",
            PageStatus::Detected => "detected",
            PageStatus::DetectionFailed => "detection_failed",
            PageStatus::Translating => "translating",
            PageStatus::Translated => "translated",
            PageStatus::TranslationFailed => "translation_failed",
            PageStatus::Rendered => "rendered",
            PageStatus::Exported => "exported",
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoded bytes of the page as it was ingested, kept for `include_original` export.
#[derive(Debug, Clone)]
pub struct OriginalImage {
    pub bytes: Arc<Vec<u8>>,
    pub extension: String,
}

#[derive(Debug, Clone)]
struct RenderCache {
    bitmap: Arc<RgbaImage>,
    style_version: u64,
    revision: u64,
}

#[derive(Debug, Clone)]
pub struct Page {
    id: PageId,
    label: String,
    source: Arc<RgbaImage>,
    original: OriginalImage,
    status: PageStatus,
    regions: Vec<TextRegion>,
    revision: u64,
    render_cache: Option<RenderCache>,
    last_error: Option<String>,
    /// Failed status the page went through; survives later render and export.
    failure: Option<PageStatus>,
}

impl Page {
    pub fn new(id: PageId, label: impl Into<String>, source: RgbaImage, original: OriginalImage) -> Self {
        Self {
            id,
            label: label.into(),
            source: Arc::new(source),
            original,
            status: PageStatus::Uploaded,
            regions: Vec::new(),
            revision: 0,
            render_cache: None,
            last_error: None,
            failure: None,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &Arc<RgbaImage> {
        &self.source
    }

    pub fn original(&self) -> &OriginalImage {
        &self.original
    }

    pub fn status(&self) -> PageStatus {
        self.status
    }

    pub fn regions(&self) -> &[TextRegion] {
        &self.regions
    }

    pub fn region(&self, region_id: u32) -> Option<&TextRegion> {
        self.regions.iter().find(|region| region.id == region_id)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The failed status this page reached, until it is reset.
    pub fn failure(&self) -> Option<PageStatus> {
        self.failure
    }

    /// Moves to `to`, returning the previous status.
    pub fn transition(&mut self, to: PageStatus) -> Result<PageStatus, PipelineError> {
        let from = self.status;
        if !from.can_transition(to) {
            return Err(PipelineError::InvalidTransition {
                page_id: self.id,
                from,
                to,
            });
        }
        self.status = to;
        Ok(from)
    }

    pub(crate) fn fail(&mut self, to: PageStatus, message: impl Into<String>) -> Result<PageStatus, PipelineError> {
        let from = self.transition(to)?;
        self.last_error = Some(message.into());
        self.failure = Some(to);
        Ok(from)
    }

    /// Explicit reset to `Uploaded`: drops regions, cache and error.
    pub(crate) fn reset(&mut self) -> PageStatus {
        let from = self.status;
        self.status = PageStatus::Uploaded;
        self.regions.clear();
        self.revision += 1;
        self.render_cache = None;
        self.last_error = None;
        self.failure = None;
        from
    }

    pub(crate) fn set_regions(&mut self, regions: Vec<TextRegion>) {
        self.regions = regions;
        self.revision += 1;
        self.render_cache = None;
    }

    /// Applies an index-aligned translation result. Edited regions keep the user's
    /// text; the machine result is still recorded for them.
    pub(crate) fn apply_translations(&mut self, texts: &[String], flagged: &[usize]) {
        for (idx, region) in self.regions.iter_mut().enumerate() {
            let Some(text) = texts.get(idx) else {
                continue;
            };
            region.machine_translation = Some(text.clone());
            region.needs_review = flagged.contains(&idx);
            if !region.edited {
                region.translated_text = text.clone();
            }
        }
        self.revision += 1;
    }

    pub(crate) fn edit_region(&mut self, region_id: u32, text: String) -> Result<(), PipelineError> {
        if !self.status.has_regions() {
            return Err(PipelineError::NotEditable {
                page_id: self.id,
                status: self.status,
            });
        }
        let page_id = self.id;
        let region = self
            .regions
            .iter_mut()
            .find(|region| region.id == region_id)
            .ok_or(PipelineError::RegionNotFound { page_id, region_id })?;
        region.translated_text = text;
        region.edited = true;
        region.needs_review = false;
        self.revision += 1;
        Ok(())
    }

    pub(crate) fn revert_region(&mut self, region_id: u32) -> Result<(), PipelineError> {
        let page_id = self.id;
        let region = self
            .regions
            .iter_mut()
            .find(|region| region.id == region_id)
            .ok_or(PipelineError::RegionNotFound { page_id, region_id })?;
        region.translated_text = region
            .machine_translation
            .clone()
            .unwrap_or_else(|| region.source_text.clone());
        region.edited = false;
        self.revision += 1;
        Ok(())
    }

    pub(crate) fn cached_render(&self, style_version: u64) -> Option<Arc<RgbaImage>> {
        let cache = self.render_cache.as_ref()?;
        if cache.revision != self.revision {
            return None;
        }
        if cache.style_version != style_version && !self.regions.is_empty() {
            return None;
        }
        Some(Arc::clone(&cache.bitmap))
    }

    pub(crate) fn store_render(&mut self, bitmap: Arc<RgbaImage>, style_version: u64) {
        self.render_cache = Some(RenderCache {
            bitmap,
            style_version,
            revision: self.revision,
        });
    }

    /// Drops a cache that is stale for `style_version`. Returns whether one was dropped.
    pub(crate) fn invalidate_stale_render(&mut self, style_version: u64) -> bool {
        let stale = self.render_cache.is_some() && self.cached_render(style_version).is_none();
        if stale {
            self.render_cache = None;
        }
        stale
    }

    pub fn has_cached_render(&self) -> bool {
        self.render_cache.is_some()
    }
}
