use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::command::command_exists;

const PAGE_PREFIX: &str = "page";

/// External tools that can turn PDF pages into PNGs, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rasterizer {
    Mutool,
    Pdftoppm,
}

impl Rasterizer {
    fn available() -> Option<Rasterizer> {
        [Rasterizer::Mutool, Rasterizer::Pdftoppm]
            .into_iter()
            .find(|tool| command_exists(tool.program()))
    }

    fn program(self) -> &'static str {
        match self {
            Rasterizer::Mutool => "mutool",
            Rasterizer::Pdftoppm => "pdftoppm",
        }
    }

    fn command(self, input: &Path, out_dir: &Path, dpi: u32) -> Command {
        let mut command = Command::new(self.program());
        let dpi = dpi.to_string();
        match self {
            Rasterizer::Mutool => {
                command
                    .args(["draw", "-r", dpi.as_str(), "-o"])
                    .arg(out_dir.join(format!("{}-%04d.png", PAGE_PREFIX)))
                    .arg(input);
            }
            Rasterizer::Pdftoppm => {
                command
                    .args(["-png", "-r", dpi.as_str()])
                    .arg(input)
                    .arg(out_dir.join(PAGE_PREFIX));
            }
        }
        command
    }
}

/// Rasterizes every page of a PDF to PNG bytes, in page order.
pub(crate) fn render_pdf_pages(pdf_bytes: &[u8], dpi: u32) -> Result<Vec<Vec<u8>>> {
    let tool = Rasterizer::available().ok_or_else(|| {
        anyhow!("pdf rendering requires mutool or pdftoppm (install mupdf or poppler)")
    })?;
    let dir = tempfile::tempdir().with_context(|| "failed to create temp dir for pdf")?;
    let input = dir.path().join("input.pdf");
    fs::write(&input, pdf_bytes).with_context(|| "failed to write temp pdf")?;

    debug!("rasterizing pdf with {} at {} dpi", tool.program(), dpi);
    let output = tool
        .command(&input, dir.path(), dpi)
        .output()
        .with_context(|| format!("failed to run {}", tool.program()))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} failed: {}",
            tool.program(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    rendered_pages(dir.path())?
        .iter()
        .map(|path| {
            fs::read(path)
                .with_context(|| format!("failed to read rendered pdf page: {}", path.display()))
        })
        .collect()
}

fn rendered_pages(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages = fs::read_dir(dir)
        .with_context(|| "failed to read temp pdf directory")?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| is_page_png(path))
        .collect::<Vec<_>>();
    // pdftoppm pads page numbers only as wide as the page count needs
    pages.sort_by(|a, b| super::natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(pages)
}

fn is_page_png(path: &Path) -> bool {
    let named_page = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.starts_with(PAGE_PREFIX));
    let png = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
    named_page && png
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_only_page_pngs_in_page_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["page-10.png", "page-2.png", "input.pdf", "page-1.PNG", "notes.png"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let names = rendered_pages(dir.path())
            .unwrap()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["page-1.PNG", "page-2.png", "page-10.png"]);
    }

    #[test]
    fn tool_arguments() {
        let dir = Path::new("/tmp/out");
        let input = Path::new("/tmp/out/input.pdf");
        let mutool = Rasterizer::Mutool.command(input, dir, 200);
        let args = mutool.get_args().map(|arg| arg.to_string_lossy()).collect::<Vec<_>>();
        assert_eq!(args, vec!["draw", "-r", "200", "-o", "/tmp/out/page-%04d.png", "/tmp/out/input.pdf"]);

        let poppler = Rasterizer::Pdftoppm.command(input, dir, 150);
        let args = poppler.get_args().map(|arg| arg.to_string_lossy()).collect::<Vec<_>>();
        assert_eq!(args, vec!["-png", "-r", "150", "/tmp/out/input.pdf", "/tmp/out/page"]);
    }
}
