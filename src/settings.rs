use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::export::{ExportFormat, ExportRequest};
use crate::ingest::DEFAULT_PDF_DPI;
use crate::ocr::{DEFAULT_PSM, DetectionConfig};
use crate::style::{HexColor, ReadingOrder, StyleConfig};
use crate::translate::TranslationConfig;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone)]
pub struct Settings {
    pub style: StyleConfig,
    pub font_path: Option<PathBuf>,
    pub detection: DetectionSettings,
    pub model: Option<String>,
    pub translation: TranslationConfig,
    pub export: ExportRequest,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub psm: u32,
    pub pdf_dpi: u32,
    pub engine: DetectionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            style: StyleConfig::default(),
            font_path: None,
            detection: DetectionSettings {
                psm: DEFAULT_PSM,
                pdf_dpi: DEFAULT_PDF_DPI,
                engine: DetectionConfig::default(),
            },
            model: None,
            translation: TranslationConfig::default(),
            export: ExportRequest::default(),
            output_dir: PathBuf::from("translated"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    style: Option<StyleSection>,
    detection: Option<DetectionSection>,
    translation: Option<TranslationSection>,
    export: Option<ExportSection>,
}

#[derive(Debug, Default, Deserialize)]
struct StyleSection {
    source_language: Option<String>,
    target_language: Option<String>,
    ocr_language: Option<String>,
    font_family: Option<String>,
    font_path: Option<String>,
    font_size: Option<f32>,
    text_color: Option<String>,
    background_color: Option<String>,
    stroke_color: Option<String>,
    stroke_width: Option<f32>,
    reading_order: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionSection {
    psm: Option<u32>,
    min_confidence: Option<f32>,
    init_timeout_secs: Option<u64>,
    pdf_dpi: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslationSection {
    model: Option<String>,
    max_chunk_items: Option<usize>,
    max_chunk_chars: Option<usize>,
    timeout_secs: Option<u64>,
    max_attempts: Option<usize>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExportSection {
    format: Option<String>,
    quality: Option<f32>,
    include_original: Option<bool>,
    output_dir: Option<String>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    if let Some(extra) = extra_path
        && !extra.exists()
    {
        return Err(anyhow!("settings file not found: {}", extra.display()));
    }
    ensure_home_settings_file()?;

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];
    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }
    if let Some(extra) = extra_path {
        ordered_paths.push(extra.to_path_buf());
    }
    load_layers(&ordered_paths)
}

/// Built-in defaults, then every existing file in `paths`, later files winning.
pub fn load_layers(paths: &[PathBuf]) -> Result<Settings> {
    let mut settings = Settings::default();
    settings
        .merge_str(DEFAULT_SETTINGS_TOML)
        .with_context(|| "failed to parse built-in settings")?;
    for path in paths {
        if !path.exists() {
            continue;
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings: {}", path.display()))?;
        settings
            .merge_str(&content)
            .with_context(|| format!("failed to parse settings: {}", path.display()))?;
    }
    settings.style.validate()?;
    Ok(settings)
}

impl Settings {
    fn merge_str(&mut self, content: &str) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)?;
        self.merge(parsed)
    }

    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(style) = incoming.style {
            self.merge_style(style)?;
        }
        if let Some(detection) = incoming.detection {
            if let Some(psm) = detection.psm {
                self.detection.psm = psm;
            }
            if let Some(confidence) = detection.min_confidence {
                self.detection.engine.min_confidence = confidence.clamp(0.0, 100.0);
            }
            if let Some(secs) = detection.init_timeout_secs.filter(|secs| *secs > 0) {
                self.detection.engine.init_timeout = Duration::from_secs(secs);
            }
            if let Some(dpi) = detection.pdf_dpi {
                self.detection.pdf_dpi = dpi;
            }
        }
        if let Some(translation) = incoming.translation {
            if let Some(model) = non_blank(translation.model) {
                self.model = Some(model);
            }
            let config = &mut self.translation;
            if let Some(items) = translation.max_chunk_items.filter(|items| *items > 0) {
                config.max_chunk_items = items;
            }
            if let Some(chars) = translation.max_chunk_chars.filter(|chars| *chars > 0) {
                config.max_chunk_chars = chars;
            }
            if let Some(secs) = translation.timeout_secs.filter(|secs| *secs > 0) {
                config.call_timeout = Duration::from_secs(secs);
            }
            if let Some(attempts) = translation.max_attempts.filter(|attempts| *attempts > 0) {
                config.max_attempts = attempts;
            }
            if let Some(ms) = translation.base_delay_ms {
                config.base_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = translation.max_delay_ms {
                config.max_delay = Duration::from_millis(ms);
            }
        }
        if let Some(export) = incoming.export {
            if let Some(format) = non_blank(export.format) {
                self.export.format = format.parse::<ExportFormat>().map_err(|err| anyhow!(err))?;
            }
            if let Some(quality) = export.quality {
                self.export.quality = quality.clamp(0.0, 1.0);
            }
            if let Some(include) = export.include_original {
                self.export.include_original = include;
            }
            if let Some(dir) = non_blank(export.output_dir) {
                self.output_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn merge_style(&mut self, incoming: StyleSection) -> Result<()> {
        let style = &mut self.style;
        for (target, value) in [
            (&mut style.source_language, incoming.source_language),
            (&mut style.target_language, incoming.target_language),
            (&mut style.ocr_language, incoming.ocr_language),
            (&mut style.font_family, incoming.font_family),
        ] {
            if let Some(value) = non_blank(value) {
                *target = value;
            }
        }
        if let Some(path) = non_blank(incoming.font_path) {
            self.font_path = Some(PathBuf::from(path));
        }
        if let Some(size) = incoming.font_size.filter(|size| *size > 0.0) {
            style.font_size = size;
        }
        for (target, value) in [
            (&mut style.text_color, incoming.text_color),
            (&mut style.background_color, incoming.background_color),
            (&mut style.stroke_color, incoming.stroke_color),
        ] {
            if let Some(value) = non_blank(value) {
                *target = value.parse::<HexColor>().map_err(|err| anyhow!(err))?;
            }
        }
        if let Some(width) = incoming.stroke_width.filter(|width| *width >= 0.0) {
            style.stroke_width = width;
        }
        if let Some(order) = non_blank(incoming.reading_order) {
            style.reading_order = order.parse::<ReadingOrder>().map_err(|err| anyhow!(err))?;
        }
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".manga-overlay-translator"))
        }
    })
}
