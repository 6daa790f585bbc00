use serde::Serialize;

use crate::page::{Page, PageId, PageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Empty,
    InProgress,
    Completed,
    CompletedWithFailures,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageFailure {
    pub page_id: PageId,
    pub status: PageStatus,
    pub error: Option<String>,
}

/// Aggregate view of the batch. `partial` counts succeeded pages that still
/// have regions flagged for review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub partial: usize,
    pub status: BatchStatus,
    pub failures: Vec<PageFailure>,
}

impl BatchSummary {
    pub fn from_pages(pages: &[Page]) -> Self {
        let mut summary = BatchSummary {
            total: pages.len(),
            succeeded: 0,
            failed: 0,
            pending: 0,
            partial: 0,
            status: BatchStatus::Empty,
            failures: Vec::new(),
        };
        for page in pages {
            if let Some(status) = page.failure() {
                summary.failed += 1;
                summary.failures.push(PageFailure {
                    page_id: page.id(),
                    status,
                    error: page.last_error().map(str::to_string),
                });
                continue;
            }
            match page.status() {
                PageStatus::Translated | PageStatus::Rendered | PageStatus::Exported => {
                    summary.succeeded += 1;
                    if page.regions().iter().any(|region| region.needs_review) {
                        summary.partial += 1;
                    }
                }
                _ => summary.pending += 1,
            }
        }
        summary.status = if summary.total == 0 {
            BatchStatus::Empty
        } else if summary.pending > 0 {
            BatchStatus::InProgress
        } else if summary.failed == 0 {
            BatchStatus::Completed
        } else if summary.succeeded > 0 {
            BatchStatus::CompletedWithFailures
        } else {
            BatchStatus::Failed
        };
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{BBox, OriginalImage, TextRegion};
    use image::RgbaImage;
    use std::sync::Arc;

    fn page(id: u64, path: &[PageStatus]) -> Page {
        let mut page = Page::new(
            PageId(id),
            format!("{}.png", id),
            RgbaImage::new(2, 2),
            OriginalImage {
                bytes: Arc::new(Vec::new()),
                extension: "png".to_string(),
            },
        );
        for status in path {
            if status.is_failed() {
                page.fail(*status, "broken").unwrap();
            } else {
                page.transition(*status).unwrap();
            }
        }
        page
    }

    #[test]
    fn counts_pages_by_outcome() {
        use PageStatus::*;
        let mut flagged = page(3, &[Detecting, Detected, Translating]);
        flagged.set_regions(vec![TextRegion::new(0, BBox::new(0, 0, 1, 1), "ab", 90.0)]);
        flagged.apply_translations(&["ab".to_string()], &[0]);
        flagged.transition(Translated).unwrap();

        let pages = vec![
            page(1, &[Detecting, Detected, Translating, Translated]),
            page(2, &[Detecting, DetectionFailed]),
            flagged,
        ];
        let summary = BatchSummary::from_pages(&pages);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.partial, 1);
        assert_eq!(summary.status, BatchStatus::CompletedWithFailures);
        assert_eq!(summary.failures[0].page_id, PageId(2));
        assert_eq!(summary.failures[0].error.as_deref(), Some("broken"));
    }

    #[test]
    fn translation_failure_outlives_render_and_export() {
        use PageStatus::*;
        let pages = vec![
            page(1, &[Detecting, Detected, Translating, TranslationFailed, Rendered, Exported]),
            page(2, &[Detecting, Detected, Translating, Translated, Exported]),
        ];
        let summary = BatchSummary::from_pages(&pages);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].page_id, PageId(1));
        assert_eq!(summary.failures[0].status, TranslationFailed);
        assert_eq!(summary.status, BatchStatus::CompletedWithFailures);
    }

    #[test]
    fn pending_pages_keep_the_batch_in_progress() {
        let pages = vec![page(1, &[]), page(2, &[PageStatus::Detecting, PageStatus::DetectionFailed])];
        let summary = BatchSummary::from_pages(&pages);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.status, BatchStatus::InProgress);
        assert_eq!(BatchSummary::from_pages(&[]).status, BatchStatus::Empty);
    }
}
