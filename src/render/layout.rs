use serde::Serialize;

use crate::page::BBox;

pub const MIN_FONT_SIZE: f32 = 8.0;
pub const SHRINK_STEP: f32 = 1.0;
pub const LINE_HEIGHT_RATIO: f32 = 1.2;

const FIT_EPSILON: f32 = 1e-3;

/// Area the text of a region may paint into, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClipRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Wrapping and sizing decision for one region. Computed in source-pixel
/// space only, so preview and export renders share it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextLayout {
    pub font_size: f32,
    pub line_height: f32,
    pub padding: f32,
    pub lines: Vec<String>,
    /// False when even the floor size overflows the inner box.
    pub fits: bool,
    pub clip: ClipRect,
}

impl TextLayout {
    pub fn block_height(&self) -> f32 {
        self.lines.len() as f32 * self.line_height
    }
}

pub(crate) fn padding_for(bbox: &BBox) -> f32 {
    (bbox.width.min(bbox.height) as f32 * 0.08).clamp(1.0, 6.0)
}

/// The bbox grown by `max(4px, 25% of height)` vertically and 10% of width horizontally.
pub(crate) fn overflow_clip(bbox: &BBox) -> ClipRect {
    let margin_y = (bbox.height as f32 * 0.25).max(4.0);
    let margin_x = bbox.width as f32 * 0.1;
    ClipRect {
        x: bbox.x as f32 - margin_x,
        y: bbox.y as f32 - margin_y,
        width: bbox.width as f32 + margin_x * 2.0,
        height: bbox.height as f32 + margin_y * 2.0,
    }
}

/// Largest size `<= max_size` (in whole-pixel steps) at which `text` wraps
/// inside `bbox` minus padding. Stops at the floor and keeps that layout.
pub(crate) fn layout_text<F>(text: &str, bbox: &BBox, max_size: f32, measure: F) -> TextLayout
where
    F: Fn(&str, f32) -> f32,
{
    let padding = padding_for(bbox);
    let inner_w = (bbox.width as f32 - padding * 2.0).max(1.0);
    let inner_h = (bbox.height as f32 - padding * 2.0).max(1.0);
    let floor = MIN_FONT_SIZE.min(max_size);

    let mut font_size = max_size;
    loop {
        let lines = wrap_text(text, inner_w, |line| measure(line, font_size));
        let line_height = font_size * LINE_HEIGHT_RATIO;
        let block_height = lines.len() as f32 * line_height;
        let widest = lines
            .iter()
            .map(|line| measure(line, font_size))
            .fold(0.0, f32::max);
        let fits = block_height <= inner_h + FIT_EPSILON && widest <= inner_w + FIT_EPSILON;
        let next = font_size - SHRINK_STEP;
        if fits || next < floor {
            return TextLayout {
                font_size,
                line_height,
                padding,
                lines,
                fits,
                clip: overflow_clip(bbox),
            };
        }
        font_size = next;
    }
}

/// Greedy word wrap. CJK characters break anywhere; a word wider than the
/// line is broken between characters.
pub(crate) fn wrap_text<F>(text: &str, max_width: f32, width_of: F) -> Vec<String>
where
    F: Fn(&str) -> f32,
{
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut current = String::new();
        for token in tokenize(paragraph) {
            if token == " " {
                if !current.is_empty() && !current.ends_with(' ') {
                    current.push(' ');
                }
                continue;
            }
            let candidate = format!("{}{}", current, token);
            if current.trim().is_empty() || width_of(candidate.trim_end()) <= max_width {
                if current.trim().is_empty() {
                    current.clear();
                }
                current = if current.is_empty() { token } else { candidate };
            } else {
                lines.push(current.trim_end().to_string());
                current = token;
            }
            if width_of(&current) > max_width && current.chars().count() > 1 {
                let mut pieces = break_chars(&current, max_width, &width_of);
                current = pieces.pop().unwrap_or_default();
                lines.extend(pieces);
            }
        }
        let last = current.trim_end();
        if !last.is_empty() {
            lines.push(last.to_string());
        }
    }
    if lines.is_empty() && !text.trim().is_empty() {
        lines.push(text.trim().to_string());
    }
    lines
}

fn break_chars<F>(word: &str, max_width: f32, width_of: &F) -> Vec<String>
where
    F: Fn(&str) -> f32,
{
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in word.chars() {
        current.push(ch);
        if width_of(&current) > max_width && current.chars().count() > 1 {
            current.pop();
            pieces.push(std::mem::take(&mut current));
            current.push(ch);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(" ".to_string());
            continue;
        }
        if is_cjk(ch) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(ch.to_string());
            continue;
        }
        current.push(ch);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3000..=0x30FF | 0x31F0..=0x31FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF | 0xFF00..=0xFFEF
    )
}
