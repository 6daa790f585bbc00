use tracing::debug;

use crate::style::ReadingOrder;

use super::DetectedText;

/// Drops results that cannot be rendered (blank text, empty or off-bitmap boxes,
/// low confidence) and clips the rest to the bitmap.
pub(crate) fn sanitize(
    detected: Vec<DetectedText>,
    width: u32,
    height: u32,
    min_confidence: f32,
) -> Vec<DetectedText> {
    let total = detected.len();
    let kept: Vec<DetectedText> = detected
        .into_iter()
        .filter_map(|item| {
            let text = item.text.trim();
            if text.is_empty() {
                return None;
            }
            let bbox = item.bbox.clip_to(width, height)?;
            let confidence = if item.confidence.is_nan() {
                0.0
            } else {
                item.confidence.clamp(0.0, 100.0)
            };
            if confidence < min_confidence {
                return None;
            }
            Some(DetectedText {
                text: text.to_string(),
                bbox,
                confidence,
            })
        })
        .collect();
    if kept.len() != total {
        debug!("dropped {} invalid detection(s)", total - kept.len());
    }
    kept
}

/// Sorts into reading order: rows top to bottom, then within a row by `order`.
/// Two regions share a row when they overlap vertically by at least half of the
/// shorter one.
pub(crate) fn reading_order(mut items: Vec<DetectedText>, order: ReadingOrder) -> Vec<DetectedText> {
    items.sort_by_key(|item| (item.bbox.y, item.bbox.x));

    let mut rows: Vec<Vec<DetectedText>> = Vec::new();
    for item in items {
        let joins_last = rows.last().is_some_and(|row| {
            row.iter()
                .any(|other| other.bbox.vertical_overlap_ratio(&item.bbox) >= 0.5)
        });
        match rows.last_mut() {
            Some(row) if joins_last => row.push(item),
            _ => rows.push(vec![item]),
        }
    }

    let right_to_left = matches!(order, ReadingOrder::RightToLeft);
    rows.into_iter()
        .flat_map(|mut row| {
            if right_to_left {
                row.sort_by(|a, b| b.bbox.right().cmp(&a.bbox.right()).then(a.bbox.y.cmp(&b.bbox.y)));
            } else {
                row.sort_by(|a, b| a.bbox.x.cmp(&b.bbox.x).then(a.bbox.y.cmp(&b.bbox.y)));
            }
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::BBox;

    fn item(text: &str, x: u32, y: u32, w: u32, h: u32) -> DetectedText {
        DetectedText {
            text: text.to_string(),
            bbox: BBox::new(x, y, w, h),
            confidence: 90.0,
        }
    }

    fn texts(items: &[DetectedText]) -> Vec<&str> {
        items.iter().map(|item| item.text.as_str()).collect()
    }

    #[test]
    fn orders_rows_then_left_to_right() {
        let items = vec![
            item("c", 10, 100, 50, 20),
            item("b", 200, 12, 50, 20),
            item("a", 10, 10, 50, 20),
        ];
        let ordered = reading_order(items, ReadingOrder::LeftToRight);
        assert_eq!(texts(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn right_to_left_reverses_within_row_only() {
        let items = vec![
            item("left", 10, 10, 50, 40),
            item("right", 300, 20, 50, 40),
            item("below", 10, 200, 50, 40),
        ];
        let ordered = reading_order(items, ReadingOrder::RightToLeft);
        assert_eq!(texts(&ordered), vec!["right", "left", "below"]);
    }

    #[test]
    fn sanitize_clips_and_filters() {
        let items = vec![
            item("  ", 0, 0, 10, 10),
            item("off", 500, 500, 10, 10),
            item("edge", 90, 90, 30, 30),
            DetectedText {
                text: "nan".to_string(),
                bbox: BBox::new(0, 0, 5, 5),
                confidence: f32::NAN,
            },
            DetectedText {
                text: "hot".to_string(),
                bbox: BBox::new(0, 0, 5, 5),
                confidence: 250.0,
            },
        ];
        let kept = sanitize(items, 100, 100, 0.0);
        assert_eq!(texts(&kept), vec!["edge", "nan", "hot"]);
        assert_eq!(kept[0].bbox, BBox::new(90, 90, 10, 10));
        assert_eq!(kept[1].confidence, 0.0);
        assert_eq!(kept[2].confidence, 100.0);

        let strict = sanitize(kept, 100, 100, 50.0);
        assert_eq!(texts(&strict), vec!["edge", "hot"]);
    }
}
