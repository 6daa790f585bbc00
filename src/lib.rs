use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod command;
pub mod error;
pub mod export;
pub mod ingest;
pub mod logging;
pub mod ocr;
pub mod page;
pub mod pipeline;
pub mod providers;
pub mod render;
pub mod settings;
pub mod style;
pub mod translate;

pub use error::{
    DetectionError, ExportError, IngestError, PipelineError, RenderError, TranslationChunkError,
};
pub use export::{ExportFormat, ExportPackager, ExportReport, ExportRequest};
pub use ingest::{IngestReport, InputFile, Ingestor};
pub use ocr::{DetectedText, DetectionConfig, DetectionEngine, RecognitionBackend, Recognizer};
pub use page::{BBox, Page, PageId, PageStatus, TextRegion};
pub use pipeline::{BatchSummary, CancelToken, Pipeline, PipelineEvent};
pub use providers::ProviderKind;
pub use render::{FontBook, OverlayRenderer, RenderOutput};
pub use style::{HexColor, ReadingOrder, StyleConfig, StyleStore};
pub use translate::{TranslationEngine, TranslationProvider};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub files: Vec<PathBuf>,
    pub mime: Option<String>,
    pub lang: Option<String>,
    pub source_lang: Option<String>,
    pub ocr_lang: Option<String>,
    pub model: Option<String>,
    pub key: Option<String>,
    pub output: Option<PathBuf>,
    pub format: Option<ExportFormat>,
    pub quality: Option<f32>,
    pub include_original: bool,
    pub font_family: Option<String>,
    pub font_path: Option<PathBuf>,
    pub font_size: Option<f32>,
    pub text_color: Option<String>,
    pub background_color: Option<String>,
    pub stroke_color: Option<String>,
    pub stroke_width: Option<f32>,
    pub reading_order: Option<String>,
    pub no_translate: bool,
    pub settings_path: Option<String>,
}

/// Ingests, detects, translates and exports `config.files`, returning a
/// human-readable report.
pub async fn run(config: Config) -> Result<String> {
    if config.files.is_empty() {
        return Err(anyhow!("no input files given"));
    }
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    apply_overrides(&mut settings, &config)?;

    let mut fonts = FontBook::system();
    if let Some(path) = settings.font_path.as_deref() {
        fonts = fonts.with_font_file(path)?;
    }
    let renderer = Arc::new(OverlayRenderer::new(fonts));
    let detection = DetectionEngine::new(
        Arc::new(ocr::TesseractBackend::new(settings.detection.psm)),
        settings.detection.engine,
    );
    let translation = if config.no_translate {
        None
    } else {
        Some(build_translation_engine(&config, &settings)?)
    };
    let style = StyleStore::new(settings.style.clone())?;
    let mut pipeline = Pipeline::new(detection, translation, renderer, style)
        .with_ingestor(Ingestor::new(settings.detection.pdf_dpi));

    let mut inputs = Vec::with_capacity(config.files.len());
    for path in &config.files {
        inputs.push(InputFile::from_path(path, config.mime.as_deref())?);
    }
    let ingest = pipeline.ingest(inputs);
    let mut lines = ingest
        .failures
        .iter()
        .map(|err| format!("skipped: {}", err))
        .collect::<Vec<_>>();
    if ingest.pages.is_empty() {
        return Err(anyhow!("none of the inputs produced a page\n{}", lines.join("\n")));
    }

    pipeline
        .run_detection()
        .await
        .with_context(|| "text detection could not start")?;
    pipeline.run_translation().await?;
    let report = pipeline.export(&settings.export, &settings.output_dir)?;

    let summary = pipeline.summary();
    for failure in &summary.failures {
        lines.push(format!(
            "page {} {}: {}",
            failure.page_id,
            failure.status,
            failure.error.as_deref().unwrap_or("unknown error")
        ));
    }
    for failure in &report.failures {
        lines.push(format!("not exported: page {} ({})", failure.position, failure.reason));
    }
    for file in &report.files {
        lines.push(format!("wrote {}", file.display()));
    }
    lines.push(format!(
        "pages: {} succeeded, {} failed, {} need review",
        summary.succeeded, summary.failed, summary.partial
    ));
    Ok(lines.join("\n"))
}

fn apply_overrides(settings: &mut settings::Settings, config: &Config) -> Result<()> {
    let style = &mut settings.style;
    for (target, value) in [
        (&mut style.target_language, &config.lang),
        (&mut style.source_language, &config.source_lang),
        (&mut style.ocr_language, &config.ocr_lang),
        (&mut style.font_family, &config.font_family),
    ] {
        if let Some(value) = value.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            *target = value.to_string();
        }
    }
    for (target, value) in [
        (&mut style.text_color, &config.text_color),
        (&mut style.background_color, &config.background_color),
        (&mut style.stroke_color, &config.stroke_color),
    ] {
        if let Some(value) = value {
            *target = value.parse::<HexColor>().map_err(|err| anyhow!(err))?;
        }
    }
    if let Some(size) = config.font_size {
        style.font_size = size;
    }
    if let Some(width) = config.stroke_width {
        style.stroke_width = width;
    }
    if let Some(order) = config.reading_order.as_deref() {
        style.reading_order = order.parse::<ReadingOrder>().map_err(|err| anyhow!(err))?;
    }
    style.validate()?;

    if let Some(path) = &config.font_path {
        settings.font_path = Some(path.clone());
    }
    if let Some(model) = &config.model {
        settings.model = Some(model.clone());
    }
    if let Some(output) = &config.output {
        settings.output_dir = output.clone();
    }
    if let Some(format) = config.format {
        settings.export.format = format;
    }
    if let Some(quality) = config.quality {
        settings.export.quality = quality.clamp(0.0, 1.0);
    }
    if config.include_original {
        settings.export.include_original = true;
    }
    Ok(())
}

fn build_translation_engine(config: &Config, settings: &settings::Settings) -> Result<TranslationEngine> {
    let selection =
        providers::resolve_provider_selection(settings.model.as_deref(), config.key.as_deref())?;
    let key = providers::resolve_key(selection.provider, config.key.as_deref())
        .with_context(|| "no API key found for selected provider")?;
    let provider = providers::build_provider(selection.provider, key, selection.model());
    Ok(TranslationEngine::new(
        Arc::new(translate::LlmTranslator::new(provider)),
        settings.translation.clone(),
    ))
}
