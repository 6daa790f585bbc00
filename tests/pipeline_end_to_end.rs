use std::fs::File;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use image::{ImageFormat, Rgba, RgbaImage};
use manga_overlay_translator::render::FontBook;
use manga_overlay_translator::translate::{
    TranslationConfig, TranslationFuture, TranslationItem, TranslationRequest,
};
use manga_overlay_translator::{
    BBox, DetectedText, DetectionConfig, DetectionEngine, ExportFormat, ExportRequest, HexColor,
    InputFile, OverlayRenderer, PageStatus, Pipeline, PipelineEvent, ReadingOrder,
    RecognitionBackend, Recognizer, StyleConfig, StyleStore, TranslationEngine,
    TranslationProvider,
};

/// Finds two speech bubbles on every page except those `broken_width` wide.
struct BubbleBackend {
    broken_width: u32,
}

struct BubbleRecognizer {
    broken_width: u32,
}

impl RecognitionBackend for BubbleBackend {
    fn name(&self) -> &str {
        "bubbles"
    }

    fn load(&self, _language: &str) -> anyhow::Result<Arc<dyn Recognizer>> {
        Ok(Arc::new(BubbleRecognizer {
            broken_width: self.broken_width,
        }))
    }
}

impl Recognizer for BubbleRecognizer {
    fn recognize(&self, image: &RgbaImage) -> anyhow::Result<Vec<DetectedText>> {
        if image.width() == self.broken_width {
            return Err(anyhow!("recognizer crashed"));
        }
        Ok(vec![
            DetectedText {
                text: "hello".to_string(),
                bbox: BBox::new(5, 10, 30, 20),
                confidence: 90.0,
            },
            DetectedText {
                text: "world".to_string(),
                bbox: BBox::new(50, 10, 30, 20),
                confidence: 90.0,
            },
        ])
    }
}

struct UppercaseProvider;

impl TranslationProvider for UppercaseProvider {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn translate(&self, request: TranslationRequest) -> TranslationFuture {
        Box::pin(async move {
            Ok(request
                .texts
                .iter()
                .enumerate()
                .map(|(index, text)| TranslationItem {
                    index: Some(index),
                    text: text.to_uppercase(),
                })
                .collect())
        })
    }
}

fn png_page(name: &str, width: u32) -> InputFile {
    let image = RgbaImage::from_pixel(width, 60, Rgba([200, 0, 0, 255]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    InputFile::new(name, None, bytes)
}

fn pipeline(broken_width: u32) -> Pipeline {
    let detection = DetectionEngine::new(
        Arc::new(BubbleBackend { broken_width }),
        DetectionConfig::default(),
    );
    let translation = TranslationEngine::new(
        Arc::new(UppercaseProvider),
        TranslationConfig {
            call_timeout: Duration::from_secs(5),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..TranslationConfig::default()
        },
    );
    let style = StyleStore::new(StyleConfig {
        reading_order: ReadingOrder::LeftToRight,
        ..StyleConfig::default()
    })
    .unwrap();
    Pipeline::new(
        detection,
        Some(translation),
        Arc::new(OverlayRenderer::new(FontBook::empty())),
        style,
    )
}

#[tokio::test]
async fn failed_detection_leaves_a_gap_in_the_archive() {
    let mut pipeline = pipeline(90);
    let report = pipeline.ingest(vec![
        png_page("page1.png", 100),
        png_page("page2.png", 90),
        png_page("page3.png", 110),
    ]);
    assert_eq!(report.pages.len(), 3);

    let detected = pipeline.run_detection().await.unwrap();
    assert_eq!(detected.succeeded.len(), 2);
    assert_eq!(detected.failed.len(), 1);
    let translated = pipeline.run_translation().await.unwrap();
    assert_eq!(translated.succeeded.len(), 2);

    let first = &pipeline.pages()[0];
    let texts = first
        .regions()
        .iter()
        .map(|region| region.translated_text.as_str())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["HELLO", "WORLD"]);
    assert_eq!(pipeline.pages()[1].status(), PageStatus::DetectionFailed);

    let dir = tempfile::tempdir().unwrap();
    let request = ExportRequest {
        format: ExportFormat::Archive,
        ..ExportRequest::default()
    };
    let export = pipeline.export(&request, dir.path()).unwrap();
    assert_eq!(export.files, vec![dir.path().join("translated_manga.zip")]);
    assert_eq!(export.failures.len(), 1);
    assert_eq!(export.failures[0].position, 2);

    let archive = zip::ZipArchive::new(File::open(&export.files[0]).unwrap()).unwrap();
    let mut names = archive.file_names().map(str::to_string).collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["translated_page_1.png", "translated_page_3.png"]);

    let summary = pipeline.summary();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].status, PageStatus::DetectionFailed);
}

#[tokio::test]
async fn style_change_invalidates_renders_but_not_old_snapshots() {
    let mut pipeline = pipeline(0);
    pipeline.ingest(vec![png_page("a.png", 100), png_page("b.png", 100)]);
    pipeline.run_detection().await.unwrap();
    pipeline.run_translation().await.unwrap();
    let first = pipeline.pages()[0].id();

    let before = pipeline.style();
    let rendered = pipeline.render_page(first).unwrap();
    assert!(!rendered.from_cache);
    assert!(pipeline.render_page(first).unwrap().from_cache);

    let mut events = pipeline.subscribe();
    let change = pipeline
        .update_style(|style| style.background_color = HexColor::rgb(0, 0, 255))
        .unwrap();
    assert!(change.changed);
    assert_eq!(change.version, before.version + 1);
    assert_eq!(before.config.background_color, HexColor::WHITE);
    assert_eq!(pipeline.style().config.background_color, HexColor::rgb(0, 0, 255));

    assert_eq!(
        events.try_recv().unwrap(),
        PipelineEvent::StyleChanged {
            version: change.version
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        PipelineEvent::CacheInvalidated { page_id: first }
    );
    assert!(events.try_recv().is_err());

    let page = pipeline.page(first).unwrap();
    assert!(!page.has_cached_render());
    let again = pipeline.render_page(first).unwrap();
    assert!(!again.from_cache);
    assert_eq!(again.image.get_pixel(8, 13), &Rgba([0, 0, 255, 255]));
    assert_eq!(rendered.image.get_pixel(8, 13), &Rgba([255, 255, 255, 255]));
}
