use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use ttf_parser::{Face, name_id};
use usvg::fontdb;

/// Advance widths of one face, enough to measure a line of text.
#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    face_index: u32,
    units_per_em: u16,
    space_advance: u16,
    family: Option<String>,
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn text_width(&self, text: &str, font_size: f32) -> f32 {
        let Ok(face) = Face::parse(&self.data, self.face_index) else {
            return estimate_text_width(text, font_size);
        };
        let advance: u32 = text
            .chars()
            .filter(|ch| *ch != '\n')
            .map(|ch| {
                face.glyph_index(ch)
                    .and_then(|glyph| face.glyph_hor_advance(glyph))
                    .unwrap_or(self.space_advance) as u32
            })
            .sum();
        advance as f32 * (font_size / self.units_per_em.max(1) as f32)
    }
}

/// Font database shared by layout and text rendering, so both see the same faces.
pub struct FontBook {
    db: Arc<fontdb::Database>,
    metrics: Mutex<HashMap<String, Option<FontMetrics>>>,
}

impl FontBook {
    /// No faces at all: text is measured by estimate and not drawn.
    pub fn empty() -> Self {
        Self::from_database(fontdb::Database::new())
    }

    pub fn system() -> Self {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        debug!("loaded {} system font face(s)", db.len());
        Self::from_database(db)
    }

    pub fn with_font_file(self, path: &Path) -> Result<Self> {
        let data =
            std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
        if ttf_parser::fonts_in_collection(&data).is_none() && Face::parse(&data, 0).is_err() {
            return Err(anyhow!("failed to parse font: {}", path.display()));
        }
        let mut db = Arc::unwrap_or_clone(self.db);
        db.load_font_data(data);
        Ok(Self::from_database(db))
    }

    fn from_database(db: fontdb::Database) -> Self {
        Self {
            db: Arc::new(db),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn database(&self) -> Arc<fontdb::Database> {
        Arc::clone(&self.db)
    }

    /// Metrics for `family`, resolved once and remembered (also when missing).
    pub(crate) fn metrics_for(&self, family: &str) -> Option<FontMetrics> {
        let mut memo = self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        memo.entry(family.to_string())
            .or_insert_with(|| {
                let resolved = resolve_family(&self.db, family);
                if let Err(err) = &resolved {
                    debug!("measuring '{}' by estimate: {}", family, err);
                }
                resolved.ok()
            })
            .clone()
    }
}

impl Default for FontBook {
    fn default() -> Self {
        Self::system()
    }
}

/// Width of `text` at `font_size` using real advances when a face is known.
pub(crate) fn measure_text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    match font {
        Some(font) => font.text_width(text, font_size),
        None => estimate_text_width(text, font_size),
    }
}

fn estimate_char_units(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.25
    } else if ch.is_ascii_alphanumeric() {
        0.55
    } else if ch.is_ascii() {
        0.35
    } else if matches!(
        ch as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0x31F0..=0x31FF | 0xAC00..=0xD7AF
    ) {
        1.0
    } else {
        0.9
    }
}

fn estimate_text_width(text: &str, font_size: f32) -> f32 {
    text.chars()
        .filter(|ch| *ch != '\n')
        .map(estimate_char_units)
        .sum::<f32>()
        * font_size
}

fn resolve_family(db: &fontdb::Database, family: &str) -> Result<FontMetrics> {
    let generic = match family.trim().to_ascii_lowercase().as_str() {
        "sans-serif" | "sans" => Some(fontdb::Family::SansSerif),
        "serif" => Some(fontdb::Family::Serif),
        "monospace" => Some(fontdb::Family::Monospace),
        "cursive" => Some(fontdb::Family::Cursive),
        "fantasy" => Some(fontdb::Family::Fantasy),
        _ => None,
    };
    let families = [generic.unwrap_or(fontdb::Family::Name(family.trim()))];
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let (data, face_index) = db
        .with_face_data(id, |data, index| (data.to_vec(), index))
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    metrics_from_data(Arc::new(data), face_index)
}

fn metrics_from_data(data: Arc<Vec<u8>>, face_index: u32) -> Result<FontMetrics> {
    let face = Face::parse(&data, face_index).map_err(|err| anyhow!("failed to parse font: {}", err))?;
    let units_per_em = face.units_per_em().max(1);
    let space_advance = face
        .glyph_index(' ')
        .and_then(|id| face.glyph_hor_advance(id))
        .unwrap_or(units_per_em / 2);
    let family = extract_family_name(&face);
    Ok(FontMetrics {
        data,
        face_index,
        units_per_em,
        space_advance,
        family,
    })
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}
