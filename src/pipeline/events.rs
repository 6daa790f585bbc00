use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::page::{PageId, PageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detection,
    Translation,
    Export,
}

/// One discrete change, published as it happens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PageAdded {
        page_id: PageId,
        label: String,
    },
    StatusChanged {
        page_id: PageId,
        from: PageStatus,
        to: PageStatus,
    },
    RegionEdited {
        page_id: PageId,
        region_id: u32,
    },
    CacheInvalidated {
        page_id: PageId,
    },
    StyleChanged {
        version: u64,
    },
    EngineFailed {
        language: String,
        reason: String,
    },
    BatchStarted {
        stage: Stage,
        pages: usize,
    },
    BatchFinished {
        stage: Stage,
        succeeded: usize,
        failed: usize,
        cancelled: bool,
    },
    SessionReset,
}

/// Cooperative cancellation, checked between pages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
