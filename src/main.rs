use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use manga_overlay_translator::ExportFormat;

#[derive(Parser, Debug)]
#[command(
    name = "manga-overlay-translator",
    version,
    about = "Detect, translate and re-letter text on manga pages"
)]
struct Cli {
    /// Page images or PDFs (png/jpeg/webp/pdf)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Force the input type for every file (auto, image/*, pdf)
    #[arg(short = 'M', long = "mime")]
    mime: Option<String>,

    /// Target language (default from settings: en)
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// Source language of the pages
    #[arg(short = 'L', long = "source-lang")]
    source_lang: Option<String>,

    /// Tesseract language list (e.g. jpn or jpn+eng)
    #[arg(long = "ocr-lang")]
    ocr_lang: Option<String>,

    /// Model name or provider:model (e.g. openai:MODEL_ID)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Output directory
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Export format: per-image | archive
    #[arg(long = "format")]
    format: Option<ExportFormat>,

    /// Encoder quality between 0.0 and 1.0
    #[arg(long = "quality")]
    quality: Option<f32>,

    /// Also write the untouched originals
    #[arg(long = "include-original")]
    include_original: bool,

    #[arg(long = "font-family")]
    font_family: Option<String>,

    /// Extra font file to load before the system fonts
    #[arg(long = "font-path")]
    font_path: Option<PathBuf>,

    #[arg(long = "font-size")]
    font_size: Option<f32>,

    /// Hex color (#rgb, #rrggbb, #rrggbbaa)
    #[arg(long = "text-color")]
    text_color: Option<String>,

    #[arg(long = "background-color")]
    background_color: Option<String>,

    #[arg(long = "stroke-color")]
    stroke_color: Option<String>,

    #[arg(long = "stroke-width")]
    stroke_width: Option<f32>,

    /// Region order within a page: auto | ltr | rtl
    #[arg(long = "reading-order")]
    reading_order: Option<String>,

    /// Skip translation and re-letter the detected source text
    #[arg(long = "no-translate")]
    no_translate: bool,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    manga_overlay_translator::logging::init(cli.verbose)?;

    let output = manga_overlay_translator::run(manga_overlay_translator::Config {
        files: cli.files,
        mime: cli.mime,
        lang: cli.lang,
        source_lang: cli.source_lang,
        ocr_lang: cli.ocr_lang,
        model: cli.model,
        key: cli.key,
        output: cli.output,
        format: cli.format,
        quality: cli.quality,
        include_original: cli.include_original,
        font_family: cli.font_family,
        font_path: cli.font_path,
        font_size: cli.font_size,
        text_color: cli.text_color,
        background_color: cli.background_color,
        stroke_color: cli.stroke_color,
        stroke_width: cli.stroke_width,
        reading_order: cli.reading_order,
        no_translate: cli.no_translate,
        settings_path: cli.read_settings,
    })
    .await?;

    println!("{}", output);
    Ok(())
}
