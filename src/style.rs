use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl HexColor {
    pub const BLACK: HexColor = HexColor::rgb(0, 0, 0);
    pub const WHITE: HexColor = HexColor::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// `#rrggbb` form for SVG paint attributes; alpha goes to the matching `*-opacity`.
    pub fn svg_rgb(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn opacity(&self) -> f32 {
        self.a as f32 / 255.0
    }
}

impl FromStr for HexColor {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = value.trim();
        let hex = raw
            .strip_prefix('#')
            .ok_or_else(|| format!("color '{}' must start with '#'", raw))?;
        if !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(format!("color '{}' has invalid hex digits", raw));
        }
        let expanded = match hex.len() {
            3 | 4 => hex.chars().flat_map(|ch| [ch, ch]).collect::<String>(),
            6 | 8 => hex.to_string(),
            _ => return Err(format!("color '{}' must be #rgb, #rrggbb or #rrggbbaa", raw)),
        };
        let channel = |idx: usize| {
            u8::from_str_radix(&expanded[idx * 2..idx * 2 + 2], 16)
                .map_err(|_| format!("color '{}' has invalid hex digits", raw))
        };
        let a = if expanded.len() == 8 { channel(3)? } else { 255 };
        Ok(Self {
            r: channel(0)?,
            g: channel(1)?,
            b: channel(2)?,
            a,
        })
    }
}

impl TryFrom<String> for HexColor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HexColor> for String {
    fn from(value: HexColor) -> Self {
        value.to_string()
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.a == 255 {
            write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadingOrder {
    #[default]
    Auto,
    LeftToRight,
    RightToLeft,
}

impl ReadingOrder {
    /// `Auto` reads right-to-left for Japanese sources only.
    pub fn resolve(self, source_language: &str) -> ReadingOrder {
        match self {
            ReadingOrder::Auto => {
                let lang = source_language.trim().to_ascii_lowercase();
                let base = lang.split(['-', '_']).next().unwrap_or_default();
                if matches!(base, "ja" | "jpn" | "jp") {
                    ReadingOrder::RightToLeft
                } else {
                    ReadingOrder::LeftToRight
                }
            }
            other => other,
        }
    }
}

impl FromStr for ReadingOrder {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ReadingOrder::Auto),
            "ltr" | "left-to-right" => Ok(ReadingOrder::LeftToRight),
            "rtl" | "right-to-left" => Ok(ReadingOrder::RightToLeft),
            other => Err(format!("unknown reading order '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleConfig {
    pub source_language: String,
    pub target_language: String,
    pub ocr_language: String,
    pub font_family: String,
    pub font_size: f32,
    pub text_color: HexColor,
    pub background_color: HexColor,
    pub stroke_color: HexColor,
    pub stroke_width: f32,
    pub reading_order: ReadingOrder,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            source_language: "ja".to_string(),
            target_language: "en".to_string(),
            ocr_language: "jpn".to_string(),
            font_family: "sans-serif".to_string(),
            font_size: 24.0,
            text_color: HexColor::BLACK,
            background_color: HexColor::WHITE,
            stroke_color: HexColor::WHITE,
            stroke_width: 0.0,
            reading_order: ReadingOrder::Auto,
        }
    }
}

impl StyleConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.font_size.is_finite() || self.font_size <= 0.0 {
            return Err(PipelineError::InvalidStyle(format!(
                "font size must be positive (got {})",
                self.font_size
            )));
        }
        if !self.stroke_width.is_finite() || self.stroke_width < 0.0 {
            return Err(PipelineError::InvalidStyle(format!(
                "stroke width must be >= 0 (got {})",
                self.stroke_width
            )));
        }
        for (name, value) in [
            ("source language", &self.source_language),
            ("target language", &self.target_language),
            ("ocr language", &self.ocr_language),
            ("font family", &self.font_family),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::InvalidStyle(format!("{} is empty", name)));
            }
        }
        Ok(())
    }

    pub fn reading_order(&self) -> ReadingOrder {
        self.reading_order.resolve(&self.source_language)
    }
}

/// Immutable view of the style at one version. Renders hold one of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleSnapshot {
    pub version: u64,
    pub config: StyleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleChange {
    pub version: u64,
    pub changed: bool,
    pub ocr_language_changed: bool,
}

/// Single-writer owner of the current style. Updates swap in a new snapshot;
/// previously handed-out snapshots never change.
#[derive(Debug, Clone)]
pub struct StyleStore {
    current: Arc<StyleSnapshot>,
}

impl StyleStore {
    pub fn new(config: StyleConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            current: Arc::new(StyleSnapshot { version: 1, config }),
        })
    }

    pub fn snapshot(&self) -> Arc<StyleSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn version(&self) -> u64 {
        self.current.version
    }

    pub fn update<F>(&mut self, apply: F) -> Result<StyleChange, PipelineError>
    where
        F: FnOnce(&mut StyleConfig),
    {
        let mut next = self.current.config.clone();
        apply(&mut next);
        next.validate()?;
        if next == self.current.config {
            return Ok(StyleChange {
                version: self.current.version,
                changed: false,
                ocr_language_changed: false,
            });
        }
        let ocr_language_changed = next.ocr_language != self.current.config.ocr_language;
        let version = self.current.version + 1;
        self.current = Arc::new(StyleSnapshot {
            version,
            config: next,
        });
        Ok(StyleChange {
            version,
            changed: true,
            ocr_language_changed,
        })
    }
}

impl Default for StyleStore {
    fn default() -> Self {
        Self {
            current: Arc::new(StyleSnapshot {
                version: 1,
                config: StyleConfig::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_colors() {
        assert_eq!("#ffffff".parse::<HexColor>().unwrap(), HexColor::WHITE);
        assert_eq!("#000".parse::<HexColor>().unwrap(), HexColor::BLACK);
        let translucent: HexColor = "#11223380".parse().unwrap();
        assert_eq!(translucent.a, 0x80);
        assert_eq!(translucent.to_string(), "#11223380");
        assert!("ffffff".parse::<HexColor>().is_err());
        assert!("#zzzzzz".parse::<HexColor>().is_err());
        // byte length matches a valid form but the digits are not ascii
        for bad in ["#a€", "#ééé", "#+1+2+3"] {
            let err = bad.parse::<HexColor>().unwrap_err();
            assert!(err.contains("invalid hex digits"), "{}", err);
        }
    }

    #[test]
    fn background_change_bumps_version_and_keeps_old_snapshot() {
        let mut store = StyleStore::new(StyleConfig::default()).unwrap();
        let before = store.snapshot();
        let change = store
            .update(|style| style.background_color = HexColor::rgb(10, 20, 30))
            .unwrap();
        assert!(change.changed);
        assert_eq!(change.version, before.version + 1);
        assert_eq!(before.config.background_color, HexColor::WHITE);
        assert_eq!(
            store.snapshot().config.background_color,
            HexColor::rgb(10, 20, 30)
        );
    }

    #[test]
    fn no_op_update_keeps_version() {
        let mut store = StyleStore::default();
        let change = store.update(|_| {}).unwrap();
        assert!(!change.changed);
        assert_eq!(change.version, 1);
    }

    #[test]
    fn rejects_invalid_font_size() {
        let mut store = StyleStore::default();
        assert!(store.update(|style| style.font_size = 0.0).is_err());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn auto_reading_order_follows_source_language() {
        assert_eq!(ReadingOrder::Auto.resolve("ja"), ReadingOrder::RightToLeft);
        assert_eq!(ReadingOrder::Auto.resolve("ko"), ReadingOrder::LeftToRight);
        assert_eq!(
            ReadingOrder::LeftToRight.resolve("ja"),
            ReadingOrder::LeftToRight
        );
    }
}
