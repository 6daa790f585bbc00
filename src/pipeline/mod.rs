//! Per-page state machine over the whole batch.
//!
//! Detection and translation run strictly one page after another; every
//! status change is published on the event channel as it happens, and one
//! failing page never stops its siblings. Only a recognition engine that
//! cannot start halts a detection run.

mod events;
mod summary;

use image::RgbaImage;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{DetectionError, PipelineError, RenderError};
use crate::export::{ExportItem, ExportPackager, ExportReport, ExportRequest};
use crate::ingest::{IngestReport, InputFile, Ingestor};
use crate::ocr::DetectionEngine;
use crate::page::{Page, PageId, PageStatus, TextRegion};
use crate::render::{OverlayRenderer, RenderOutput};
use crate::style::{StyleChange, StyleConfig, StyleSnapshot, StyleStore};
use crate::translate::TranslationEngine;

pub use events::{CancelToken, PipelineEvent, Stage};
pub use summary::{BatchStatus, BatchSummary, PageFailure};

const EVENT_CAPACITY: usize = 256;

/// Outcome of one batch run over the pages that were eligible for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageReport {
    pub succeeded: Vec<PageId>,
    pub failed: Vec<PageId>,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct PageRender {
    pub image: Arc<RgbaImage>,
    pub issues: Vec<RenderError>,
    /// True when the cached bitmap was still valid.
    pub from_cache: bool,
}

enum PageOutcome {
    Succeeded,
    Failed,
}

#[derive(Clone, Copy)]
enum PageStep {
    Detect,
    Translate,
}

impl PageStep {
    fn stage(self) -> Stage {
        match self {
            PageStep::Detect => Stage::Detection,
            PageStep::Translate => Stage::Translation,
        }
    }
}

pub struct Pipeline {
    ingestor: Ingestor,
    pages: Vec<Page>,
    detection: DetectionEngine,
    /// `None` keeps every region's source text.
    translation: Option<TranslationEngine>,
    renderer: Arc<OverlayRenderer>,
    packager: ExportPackager,
    style: StyleStore,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(
        detection: DetectionEngine,
        translation: Option<TranslationEngine>,
        renderer: Arc<OverlayRenderer>,
        style: StyleStore,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ingestor: Ingestor::default(),
            pages: Vec::new(),
            detection,
            translation,
            packager: ExportPackager::new(Arc::clone(&renderer)),
            renderer,
            style,
            events,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_ingestor(mut self, ingestor: Ingestor) -> Self {
        self.ingestor = ingestor;
        self
    }

    pub fn with_packager(mut self, packager: ExportPackager) -> Self {
        self.packager = packager;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, page_id: PageId) -> Option<&Page> {
        self.pages.iter().find(|page| page.id() == page_id)
    }

    pub fn style(&self) -> Arc<StyleSnapshot> {
        self.style.snapshot()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary::from_pages(&self.pages)
    }

    pub fn ingest(&mut self, files: Vec<InputFile>) -> IngestReport {
        let report = self.ingestor.ingest(files);
        for page in &report.pages {
            self.publish(PipelineEvent::PageAdded {
                page_id: page.id(),
                label: page.label().to_string(),
            });
            self.pages.push(page.clone());
        }
        report
    }

    /// Detects text on every `Uploaded` page, in batch order.
    pub async fn run_detection(&mut self) -> Result<StageReport, PipelineError> {
        let targets = self.ids_with_status(PageStatus::Uploaded);
        self.run_stage(PageStep::Detect, targets).await
    }

    /// Translates every `Detected` page, in batch order.
    pub async fn run_translation(&mut self) -> Result<StageReport, PipelineError> {
        let targets = self.ids_with_status(PageStatus::Detected);
        self.run_stage(PageStep::Translate, targets).await
    }

    async fn run_stage(&mut self, step: PageStep, targets: Vec<PageId>) -> Result<StageReport, PipelineError> {
        let stage = step.stage();
        self.publish(PipelineEvent::BatchStarted {
            stage,
            pages: targets.len(),
        });
        let mut report = StageReport::default();
        for page_id in targets {
            if self.cancel.is_cancelled() {
                info!("{:?} cancelled before page {}", stage, page_id);
                report.cancelled = true;
                break;
            }
            let outcome = match step {
                PageStep::Detect => self.detect_page(page_id).await,
                PageStep::Translate => self.translate_page(page_id).await,
            };
            match outcome {
                Ok(PageOutcome::Succeeded) => report.succeeded.push(page_id),
                Ok(PageOutcome::Failed) => report.failed.push(page_id),
                Err(err) => {
                    self.finish_stage(stage, &report);
                    return Err(err);
                }
            }
        }
        self.finish_stage(stage, &report);
        Ok(report)
    }

    /// Publishes the stage result and re-arms the cancel token.
    fn finish_stage(&self, stage: Stage, report: &StageReport) {
        self.cancel.clear();
        info!(
            "{:?}: {} succeeded, {} failed{}",
            stage,
            report.succeeded.len(),
            report.failed.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        self.publish(PipelineEvent::BatchFinished {
            stage,
            succeeded: report.succeeded.len(),
            failed: report.failed.len(),
            cancelled: report.cancelled,
        });
    }

    async fn detect_page(&mut self, page_id: PageId) -> Result<PageOutcome, PipelineError> {
        let snapshot = self.style.snapshot();
        let style = &snapshot.config;
        let idx = self.index_of(page_id)?;
        self.move_page(idx, PageStatus::Detecting)?;
        let image = Arc::clone(self.pages[idx].source());

        let detected = self
            .detection
            .detect(page_id, image, &style.ocr_language, style.reading_order())
            .await;
        match detected {
            Ok(found) => {
                let regions = found
                    .into_iter()
                    .enumerate()
                    .map(|(id, text)| TextRegion::new(id as u32, text.bbox, text.text, text.confidence))
                    .collect();
                self.pages[idx].set_regions(regions);
                self.move_page(idx, PageStatus::Detected)?;
                Ok(PageOutcome::Succeeded)
            }
            Err(err) if err.is_session_fatal() => {
                // the page never got a chance; it goes back to the queue
                let from = self.pages[idx].reset();
                self.publish(PipelineEvent::StatusChanged {
                    page_id,
                    from,
                    to: PageStatus::Uploaded,
                });
                if let DetectionError::EngineInit { language, reason } = &err {
                    self.publish(PipelineEvent::EngineFailed {
                        language: language.clone(),
                        reason: reason.clone(),
                    });
                }
                Err(err.into())
            }
            Err(err) => {
                warn!("{}", err);
                let from = self.pages[idx].fail(PageStatus::DetectionFailed, err.to_string())?;
                self.publish(PipelineEvent::StatusChanged {
                    page_id,
                    from,
                    to: PageStatus::DetectionFailed,
                });
                Ok(PageOutcome::Failed)
            }
        }
    }

    async fn translate_page(&mut self, page_id: PageId) -> Result<PageOutcome, PipelineError> {
        let snapshot = self.style.snapshot();
        let style = &snapshot.config;
        let idx = self.index_of(page_id)?;
        self.move_page(idx, PageStatus::Translating)?;

        let texts = self.pages[idx]
            .regions()
            .iter()
            .map(|region| region.source_text.clone())
            .collect::<Vec<_>>();
        let Some(engine) = self.translation.as_mut() else {
            self.pages[idx].apply_translations(&texts, &[]);
            self.move_page(idx, PageStatus::Translated)?;
            return Ok(PageOutcome::Succeeded);
        };

        let batch = engine
            .translate_batch(&texts, &style.source_language, &style.target_language)
            .await;
        self.pages[idx].apply_translations(&batch.texts, &batch.flagged);
        if batch.has_failed_chunks() {
            let reason = batch
                .chunk_errors
                .iter()
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            let from = self.pages[idx].fail(PageStatus::TranslationFailed, reason)?;
            self.publish(PipelineEvent::StatusChanged {
                page_id,
                from,
                to: PageStatus::TranslationFailed,
            });
            return Ok(PageOutcome::Failed);
        }
        if !batch.flagged.is_empty() {
            debug!(
                "page {}: {} region(s) need review",
                page_id,
                batch.flagged.len()
            );
        }
        self.move_page(idx, PageStatus::Translated)?;
        Ok(PageOutcome::Succeeded)
    }

    pub fn edit_region(&mut self, page_id: PageId, region_id: u32, text: impl Into<String>) -> Result<(), PipelineError> {
        let idx = self.index_of(page_id)?;
        let had_cache = self.pages[idx].has_cached_render();
        self.pages[idx].edit_region(region_id, text.into())?;
        self.after_region_change(idx, region_id, had_cache);
        Ok(())
    }

    /// Restores the machine translation (or the source text) of one region.
    pub fn revert_region(&mut self, page_id: PageId, region_id: u32) -> Result<(), PipelineError> {
        let idx = self.index_of(page_id)?;
        let had_cache = self.pages[idx].has_cached_render();
        self.pages[idx].revert_region(region_id)?;
        self.after_region_change(idx, region_id, had_cache);
        Ok(())
    }

    fn after_region_change(&self, idx: usize, region_id: u32, had_cache: bool) {
        let page_id = self.pages[idx].id();
        self.publish(PipelineEvent::RegionEdited { page_id, region_id });
        if had_cache {
            self.publish(PipelineEvent::CacheInvalidated { page_id });
        }
    }

    /// Full-resolution render, served from the page cache while it is valid.
    pub fn render_page(&mut self, page_id: PageId) -> Result<PageRender, PipelineError> {
        let idx = self.index_of(page_id)?;
        self.ensure_has_regions(idx)?;
        let snapshot = self.style.snapshot();
        if let Some(image) = self.pages[idx].cached_render(snapshot.version) {
            return Ok(PageRender {
                image,
                issues: Vec::new(),
                from_cache: true,
            });
        }

        let page = &self.pages[idx];
        let output = self
            .renderer
            .render(page.source(), page.regions(), &snapshot.config)?;
        let image = Arc::new(output.image);
        self.pages[idx].store_render(Arc::clone(&image), snapshot.version);
        if self.pages[idx].status().can_transition(PageStatus::Rendered) {
            self.move_page(idx, PageStatus::Rendered)?;
        }
        Ok(PageRender {
            image,
            issues: output.issues,
            from_cache: false,
        })
    }

    /// Downscaled render for display. Never cached and never changes status.
    pub fn render_preview(&self, page_id: PageId, max_dim: u32) -> Result<RenderOutput, PipelineError> {
        let idx = self.index_of(page_id)?;
        self.ensure_has_regions(idx)?;
        let page = &self.pages[idx];
        let snapshot = self.style.snapshot();
        Ok(self
            .renderer
            .render_preview(page.source(), page.regions(), &snapshot.config, max_dim)?)
    }

    pub fn update_style<F>(&mut self, apply: F) -> Result<StyleChange, PipelineError>
    where
        F: FnOnce(&mut StyleConfig),
    {
        let change = self.style.update(apply)?;
        if !change.changed {
            return Ok(change);
        }
        info!("style updated to version {}", change.version);
        self.publish(PipelineEvent::StyleChanged {
            version: change.version,
        });
        for idx in 0..self.pages.len() {
            if self.pages[idx].invalidate_stale_render(change.version) {
                self.publish(PipelineEvent::CacheInvalidated {
                    page_id: self.pages[idx].id(),
                });
            }
        }
        if change.ocr_language_changed {
            debug!("ocr language changed; recognizer reloads on next detection");
        }
        Ok(change)
    }

    /// Packages every page in batch order. Positions in file names are
    /// 1-indexed batch positions, so gaps mark pages that failed.
    pub fn export(&mut self, request: &ExportRequest, output_dir: &Path) -> Result<ExportReport, PipelineError> {
        let snapshot = self.style.snapshot();
        let items = self
            .pages
            .iter()
            .enumerate()
            .map(|(idx, page)| ExportItem {
                page_id: page.id(),
                position: idx + 1,
                status: page.status(),
                source: Arc::clone(page.source()),
                regions: page.regions().to_vec(),
                cached: page.cached_render(snapshot.version),
                original: page.original().clone(),
            })
            .collect::<Vec<_>>();
        self.publish(PipelineEvent::BatchStarted {
            stage: Stage::Export,
            pages: items.len(),
        });

        let result = self
            .packager
            .export(&items, request, &snapshot.config, output_dir);
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                self.publish(PipelineEvent::BatchFinished {
                    stage: Stage::Export,
                    succeeded: 0,
                    failed: items.len(),
                    cancelled: false,
                });
                return Err(err.into());
            }
        };
        for page_id in &report.exported {
            let idx = self.index_of(*page_id)?;
            self.move_page(idx, PageStatus::Exported)?;
        }
        self.publish(PipelineEvent::BatchFinished {
            stage: Stage::Export,
            succeeded: report.exported.len(),
            failed: report.failures.len(),
            cancelled: false,
        });
        Ok(report)
    }

    /// Manual retry of one page: reset to `Uploaded`, detect again and, when
    /// `translate` is set, translate it too.
    pub async fn retry_page(&mut self, page_id: PageId, translate: bool) -> Result<PageStatus, PipelineError> {
        self.reset_page(page_id)?;
        if let PageOutcome::Succeeded = self.detect_page(page_id).await?
            && translate
        {
            self.translate_page(page_id).await?;
        }
        let idx = self.index_of(page_id)?;
        Ok(self.pages[idx].status())
    }

    pub fn reset_page(&mut self, page_id: PageId) -> Result<(), PipelineError> {
        let idx = self.index_of(page_id)?;
        let from = self.pages[idx].reset();
        self.publish(PipelineEvent::StatusChanged {
            page_id,
            from,
            to: PageStatus::Uploaded,
        });
        Ok(())
    }

    /// Explicit re-init of the recognizer after a failed start.
    pub async fn reinitialize_engine(&mut self) -> Result<(), PipelineError> {
        let language = self.style.snapshot().config.ocr_language.clone();
        self.detection.reinitialize(&language).await?;
        Ok(())
    }

    /// Drops every page and the translation memo. Page ids keep counting up.
    pub async fn reset_session(&mut self) {
        self.pages.clear();
        if let Some(engine) = self.translation.as_mut() {
            engine.clear_memo();
        }
        self.detection.shutdown().await;
        info!("session reset");
        self.publish(PipelineEvent::SessionReset);
    }

    fn ids_with_status(&self, status: PageStatus) -> Vec<PageId> {
        self.pages
            .iter()
            .filter(|page| page.status() == status)
            .map(Page::id)
            .collect()
    }

    fn index_of(&self, page_id: PageId) -> Result<usize, PipelineError> {
        self.pages
            .iter()
            .position(|page| page.id() == page_id)
            .ok_or(PipelineError::PageNotFound(page_id))
    }

    fn ensure_has_regions(&self, idx: usize) -> Result<(), PipelineError> {
        let page = &self.pages[idx];
        if page.status().has_regions() {
            return Ok(());
        }
        Err(PipelineError::NotEditable {
            page_id: page.id(),
            status: page.status(),
        })
    }

    fn move_page(&mut self, idx: usize, to: PageStatus) -> Result<(), PipelineError> {
        let page = &mut self.pages[idx];
        let from = page.transition(to)?;
        let page_id = page.id();
        debug!("page {}: {} -> {}", page_id, from, to);
        self.publish(PipelineEvent::StatusChanged { page_id, from, to });
        Ok(())
    }

    fn publish(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportFormat, ExportOutcome};
    use crate::ocr::testing::FakeBackend;
    use crate::ocr::{DetectedText, DetectionConfig};
    use crate::page::BBox;
    use crate::render::FontBook;
    use crate::style::HexColor;
    use crate::translate::testing::{Behavior, FakeProvider, quick_config};
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    fn png(width: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, 60, Rgba([240, 240, 240, 255]));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    fn detected(text: &str, x: u32) -> DetectedText {
        DetectedText {
            text: text.to_string(),
            bbox: BBox::new(x, 10, 30, 20),
            confidence: 90.0,
        }
    }

    struct Harness {
        pipeline: Pipeline,
        provider: Arc<FakeProvider>,
    }

    fn harness(backend: FakeBackend, behavior: Behavior) -> Harness {
        let provider = Arc::new(FakeProvider::new(behavior));
        let mut style = StyleConfig::default();
        style.reading_order = crate::style::ReadingOrder::LeftToRight;
        let pipeline = Pipeline::new(
            DetectionEngine::new(Arc::new(backend), DetectionConfig::default()),
            Some(TranslationEngine::new(provider.clone(), quick_config())),
            Arc::new(OverlayRenderer::new(FontBook::empty())),
            StyleStore::new(style).unwrap(),
        );
        Harness { pipeline, provider }
    }

    fn backend_failing_on(widths: Vec<u32>) -> FakeBackend {
        let mut backend = FakeBackend::new(vec![detected("hello", 5), detected("world", 50)]);
        backend.failing_widths = widths;
        backend
    }

    fn ingest(pipeline: &mut Pipeline, widths: &[u32]) -> Vec<PageId> {
        let files = widths
            .iter()
            .enumerate()
            .map(|(idx, width)| InputFile::new(format!("{:02}.png", idx), Some("image/png"), png(*width)))
            .collect();
        pipeline
            .ingest(files)
            .pages
            .iter()
            .map(Page::id)
            .collect()
    }

    fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn detection_failure_stays_on_its_page() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(vec![81]), Behavior::Reversed);
        let ids = ingest(&mut pipeline, &[80, 81, 82]);
        let mut rx = pipeline.subscribe();

        let report = pipeline.run_detection().await.unwrap();
        assert_eq!(report.succeeded, vec![ids[0], ids[2]]);
        assert_eq!(report.failed, vec![ids[1]]);
        assert_eq!(pipeline.page(ids[1]).unwrap().status(), PageStatus::DetectionFailed);
        assert_eq!(pipeline.page(ids[2]).unwrap().regions().len(), 2);

        let events = drain(&mut rx);
        assert_eq!(
            events.first(),
            Some(&PipelineEvent::BatchStarted {
                stage: Stage::Detection,
                pages: 3
            })
        );
        assert!(events.contains(&PipelineEvent::StatusChanged {
            page_id: ids[1],
            from: PageStatus::Detecting,
            to: PageStatus::DetectionFailed,
        }));
        // page 2 fails before page 3 starts
        let failed_at = events
            .iter()
            .position(|event| matches!(event, PipelineEvent::StatusChanged { to: PageStatus::DetectionFailed, .. }))
            .unwrap();
        let third_started = events
            .iter()
            .position(|event| matches!(event, PipelineEvent::StatusChanged { page_id, to: PageStatus::Detecting, .. } if *page_id == ids[2]))
            .unwrap();
        assert!(failed_at < third_started);
    }

    #[tokio::test]
    async fn engine_init_failure_halts_detection_until_reinit() {
        let mut backend = backend_failing_on(Vec::new());
        backend.bad_language = Some("jpn".to_string());
        let Harness { mut pipeline, .. } = harness(backend, Behavior::Reversed);
        let ids = ingest(&mut pipeline, &[80, 81]);
        let mut rx = pipeline.subscribe();

        let err = pipeline.run_detection().await.unwrap_err();
        assert!(matches!(err, PipelineError::Detection(DetectionError::EngineInit { .. })));
        assert!(ids
            .iter()
            .all(|id| pipeline.page(*id).unwrap().status() == PageStatus::Uploaded));
        let engine_failures = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, PipelineEvent::EngineFailed { .. }))
            .count();
        assert_eq!(engine_failures, 1);

        let again = pipeline.run_detection().await.unwrap_err();
        assert!(matches!(
            again,
            PipelineError::Detection(DetectionError::EngineUnavailable { .. })
        ));
        assert!(pipeline.reinitialize_engine().await.is_err());

        pipeline
            .update_style(|style| style.ocr_language = "eng".to_string())
            .unwrap();
        let report = pipeline.run_detection().await.unwrap();
        assert_eq!(report.succeeded, ids);
    }

    #[tokio::test]
    async fn translation_fills_regions_in_order() {
        let Harness { mut pipeline, provider } = harness(backend_failing_on(Vec::new()), Behavior::Reversed);
        let ids = ingest(&mut pipeline, &[80]);
        pipeline.run_detection().await.unwrap();
        let report = pipeline.run_translation().await.unwrap();
        assert_eq!(report.succeeded, ids);

        let page = pipeline.page(ids[0]).unwrap();
        assert_eq!(page.status(), PageStatus::Translated);
        let texts = page
            .regions()
            .iter()
            .map(|region| region.translated_text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["[EN] hello", "[EN] world"]);
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_chunks_mark_the_page_but_keep_source_text() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(Vec::new()), Behavior::Fail);
        let ids = ingest(&mut pipeline, &[80, 81]);
        pipeline.run_detection().await.unwrap();
        let report = pipeline.run_translation().await.unwrap();
        assert_eq!(report.failed, ids);

        let page = pipeline.page(ids[0]).unwrap();
        assert_eq!(page.status(), PageStatus::TranslationFailed);
        assert!(page.last_error().unwrap().contains("provider unavailable"));
        assert_eq!(page.regions()[0].translated_text, "hello");
        assert!(page.regions()[0].needs_review);
        assert_eq!(pipeline.summary().failed, 2);
    }

    #[tokio::test]
    async fn translation_failure_stays_counted_after_render_and_export() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(Vec::new()), Behavior::Fail);
        let ids = ingest(&mut pipeline, &[80]);
        pipeline.run_detection().await.unwrap();
        pipeline.run_translation().await.unwrap();

        pipeline.render_page(ids[0]).unwrap();
        assert_eq!(pipeline.page(ids[0]).unwrap().status(), PageStatus::Rendered);
        assert_eq!(pipeline.summary().failed, 1);

        let dir = tempfile::tempdir().unwrap();
        let request = ExportRequest {
            format: ExportFormat::PerImage,
            quality: 0.8,
            include_original: false,
        };
        let report = pipeline.export(&request, dir.path()).unwrap();
        assert_eq!(report.exported, ids);
        assert_eq!(pipeline.page(ids[0]).unwrap().status(), PageStatus::Exported);

        let summary = pipeline.summary();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failures[0].status, PageStatus::TranslationFailed);
        assert!(summary.failures[0].error.as_deref().unwrap().contains("provider unavailable"));
    }

    #[tokio::test]
    async fn short_provider_output_only_flags_regions() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(Vec::new()), Behavior::FirstOnly);
        let ids = ingest(&mut pipeline, &[80]);
        pipeline.run_detection().await.unwrap();
        pipeline.run_translation().await.unwrap();
        let page = pipeline.page(ids[0]).unwrap();
        assert_eq!(page.status(), PageStatus::Translated);
        assert!(page.regions()[1].needs_review);
        assert_eq!(pipeline.summary().partial, 1);
    }

    #[tokio::test]
    async fn no_translate_keeps_source_text() {
        let Harness { mut pipeline, provider } = harness(backend_failing_on(Vec::new()), Behavior::Reversed);
        pipeline.translation = None;
        let ids = ingest(&mut pipeline, &[80]);
        pipeline.run_detection().await.unwrap();
        pipeline.run_translation().await.unwrap();
        let page = pipeline.page(ids[0]).unwrap();
        assert_eq!(page.status(), PageStatus::Translated);
        assert_eq!(page.regions()[0].translated_text, "hello");
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn edits_invalidate_only_their_page() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(Vec::new()), Behavior::Reversed);
        let ids = ingest(&mut pipeline, &[80, 81]);
        pipeline.run_detection().await.unwrap();
        pipeline.run_translation().await.unwrap();
        pipeline.render_page(ids[0]).unwrap();
        pipeline.render_page(ids[1]).unwrap();
        assert!(pipeline.render_page(ids[0]).unwrap().from_cache);
        let mut rx = pipeline.subscribe();

        pipeline.edit_region(ids[0], 1, "Everyone").unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                PipelineEvent::RegionEdited {
                    page_id: ids[0],
                    region_id: 1
                },
                PipelineEvent::CacheInvalidated { page_id: ids[0] },
            ]
        );
        assert!(!pipeline.render_page(ids[0]).unwrap().from_cache);
        assert!(pipeline.render_page(ids[1]).unwrap().from_cache);

        let region = &pipeline.page(ids[0]).unwrap().regions()[1];
        assert!(region.edited);
        assert_eq!(region.machine_translation.as_deref(), Some("[EN] world"));

        pipeline.revert_region(ids[0], 1).unwrap();
        assert_eq!(
            pipeline.page(ids[0]).unwrap().regions()[1].translated_text,
            "[EN] world"
        );
        assert!(matches!(
            pipeline.edit_region(ids[0], 42, "x"),
            Err(PipelineError::RegionNotFound { region_id: 42, .. })
        ));
    }

    #[tokio::test]
    async fn style_change_invalidates_every_cached_render() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(Vec::new()), Behavior::Reversed);
        let ids = ingest(&mut pipeline, &[80, 81]);
        pipeline.run_detection().await.unwrap();
        pipeline.run_translation().await.unwrap();
        for id in &ids {
            pipeline.render_page(*id).unwrap();
        }
        let before = pipeline.style();
        let mut rx = pipeline.subscribe();

        let change = pipeline
            .update_style(|style| style.background_color = HexColor::rgb(200, 0, 0))
            .unwrap();
        assert_eq!(change.version, before.version + 1);
        assert_eq!(before.config.background_color, HexColor::WHITE);
        let invalidated = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, PipelineEvent::CacheInvalidated { .. }))
            .count();
        assert_eq!(invalidated, 2);
        for id in &ids {
            assert!(!pipeline.page(*id).unwrap().has_cached_render());
        }
        let render = pipeline.render_page(ids[0]).unwrap();
        assert_eq!(render.image.get_pixel(8, 13).0, [200, 0, 0, 255]);
    }

    #[tokio::test]
    async fn rendering_requires_detected_regions() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(vec![80]), Behavior::Reversed);
        let ids = ingest(&mut pipeline, &[80]);
        assert!(matches!(
            pipeline.render_page(ids[0]),
            Err(PipelineError::NotEditable { .. })
        ));
        pipeline.run_detection().await.unwrap();
        assert!(pipeline.render_preview(ids[0], 40).is_err());
        assert!(matches!(
            pipeline.render_page(PageId(999)),
            Err(PipelineError::PageNotFound(PageId(999)))
        ));
    }

    #[tokio::test]
    async fn retry_without_translation_stops_after_detection() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(Vec::new()), Behavior::Fail);
        let ids = ingest(&mut pipeline, &[80]);
        pipeline.run_detection().await.unwrap();
        pipeline.run_translation().await.unwrap();
        assert_eq!(pipeline.page(ids[0]).unwrap().status(), PageStatus::TranslationFailed);

        let status = pipeline.retry_page(ids[0], false).await.unwrap();
        assert_eq!(status, PageStatus::Detected);
        assert!(pipeline.page(ids[0]).unwrap().last_error().is_none());
    }

    #[tokio::test]
    async fn retry_after_transient_failure_succeeds() {
        let Harness { mut pipeline, provider } = harness(backend_failing_on(Vec::new()), Behavior::Fail);
        let ids = ingest(&mut pipeline, &[80]);
        pipeline.run_detection().await.unwrap();
        pipeline.run_translation().await.unwrap();

        provider.set_behavior(Behavior::Reversed);
        let status = pipeline.retry_page(ids[0], true).await.unwrap();
        assert_eq!(status, PageStatus::Translated);
        assert_eq!(pipeline.summary().succeeded, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_between_pages() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(Vec::new()), Behavior::Reversed);
        ingest(&mut pipeline, &[80, 81]);
        pipeline.cancel_token().cancel();

        let report = pipeline.run_detection().await.unwrap();
        assert!(report.cancelled);
        assert!(report.succeeded.is_empty());
        assert_eq!(pipeline.summary().pending, 2);

        let resumed = pipeline.run_detection().await.unwrap();
        assert!(!resumed.cancelled);
        assert_eq!(resumed.succeeded.len(), 2);
    }

    #[tokio::test]
    async fn export_marks_written_pages() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(vec![81]), Behavior::Reversed);
        let ids = ingest(&mut pipeline, &[80, 81, 82]);
        pipeline.run_detection().await.unwrap();
        pipeline.run_translation().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let request = ExportRequest {
            format: ExportFormat::PerImage,
            quality: 0.2,
            include_original: true,
        };
        let report = pipeline.export(&request, dir.path()).unwrap();
        assert_eq!(report.outcome, ExportOutcome::Partial);
        assert_eq!(report.failed_pages(), vec![ids[1]]);
        assert!(dir.path().join("translated_page_3.png").exists());
        assert!(dir.path().join("original/original_page_1.png").exists());
        assert_eq!(pipeline.page(ids[0]).unwrap().status(), PageStatus::Exported);
        assert_eq!(pipeline.page(ids[1]).unwrap().status(), PageStatus::DetectionFailed);
    }

    #[tokio::test]
    async fn reset_session_drops_pages_but_not_ids() {
        let Harness { mut pipeline, .. } = harness(backend_failing_on(Vec::new()), Behavior::Reversed);
        let first = ingest(&mut pipeline, &[80]);
        pipeline.reset_session().await;
        assert!(pipeline.pages().is_empty());
        let second = ingest(&mut pipeline, &[80]);
        assert!(second[0] > first[0]);
        assert!(pipeline.page(first[0]).is_none());
    }
}
