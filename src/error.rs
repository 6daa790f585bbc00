use thiserror::Error;

use crate::page::{PageId, PageStatus};

/// Failure of a single ingestion input (or a single entry of a container).
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("unsupported format '{mime}' for {label}")]
    UnsupportedFormat { label: String, mime: String },

    #[error("failed to decode {label}: {reason}")]
    DecodeError { label: String, reason: String },
}

/// Recognition failures. `EngineInit` is session-fatal, `Detection` is page-local.
#[derive(Debug, Clone, Error)]
pub enum DetectionError {
    #[error("recognition engine failed to initialize for '{language}': {reason}")]
    EngineInit { language: String, reason: String },

    #[error("recognition engine unavailable after failed init for '{language}'; re-initialize it")]
    EngineUnavailable { language: String },

    #[error("detection failed on page {page_id}: {reason}")]
    Detection { page_id: PageId, reason: String },
}

impl DetectionError {
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            DetectionError::EngineInit { .. } | DetectionError::EngineUnavailable { .. }
        )
    }
}

#[derive(Debug, Clone, Error)]
#[error("translation chunk {chunk} (items {start}..{end}) failed after {attempts} attempt(s): {reason}")]
pub struct TranslationChunkError {
    pub chunk: usize,
    pub start: usize,
    pub end: usize,
    pub attempts: usize,
    pub reason: String,
}

/// Region-local render problem; the region falls back to a background-only overlay.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("region {region_id} lies outside the {width}x{height} page")]
    RegionOutOfBounds {
        region_id: u32,
        width: u32,
        height: u32,
    },

    #[error("failed to build text scene for region {region_id}: {reason}")]
    TextScene { region_id: u32, reason: String },

    #[error("invalid page bitmap: {0}")]
    Bitmap(String),
}

#[derive(Debug, Clone, Error)]
pub enum ExportError {
    #[error("failed to encode page {page_id}: {reason}")]
    EncodeError { page_id: PageId, reason: String },

    #[error("page {page_id} is not exportable in status {status}")]
    NotExportable { page_id: PageId, status: PageStatus },

    #[error("packaging failed: {0}")]
    PackagingError(String),
}

/// Errors surfaced by orchestrator operations themselves (not per-item outcomes).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("page {0} not found")]
    PageNotFound(PageId),

    #[error("region {region_id} not found on page {page_id}")]
    RegionNotFound { page_id: PageId, region_id: u32 },

    #[error("page {page_id} cannot move from {from} to {to}")]
    InvalidTransition {
        page_id: PageId,
        from: PageStatus,
        to: PageStatus,
    },

    #[error("page {page_id} has no detected regions to edit (status {status})")]
    NotEditable { page_id: PageId, status: PageStatus },

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("invalid style: {0}")]
    InvalidStyle(String),
}
