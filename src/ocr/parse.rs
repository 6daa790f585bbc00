use std::collections::BTreeMap;

use crate::page::BBox;

use super::DetectedText;

#[derive(Clone)]
struct WordToken {
    line: i32,
    text: String,
    bbox: BBox,
    conf: f32,
    len: usize,
}

/// Groups tesseract TSV words into paragraph-level regions (one speech bubble is
/// usually one paragraph). Lines inside a paragraph are joined in order.
pub(super) fn parse_tsv_regions(tsv: &str) -> Vec<DetectedText> {
    let mut paragraphs: BTreeMap<(i32, i32, i32), Vec<WordToken>> = BTreeMap::new();

    for (idx, row) in tsv.lines().enumerate() {
        if idx == 0 {
            continue;
        }
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 12 {
            continue;
        }
        let level: i32 = cols[0].parse().unwrap_or(0);
        if level != 5 {
            continue;
        }
        let page_num: i32 = cols[1].parse().unwrap_or(0);
        let block_num: i32 = cols[2].parse().unwrap_or(0);
        let par_num: i32 = cols[3].parse().unwrap_or(0);
        let line_num: i32 = cols[4].parse().unwrap_or(0);
        let left: u32 = cols[6].parse().unwrap_or(0);
        let top: u32 = cols[7].parse().unwrap_or(0);
        let width: u32 = cols[8].parse().unwrap_or(0);
        let height: u32 = cols[9].parse().unwrap_or(0);
        let conf: f32 = cols[10].trim().parse().unwrap_or(-1.0);
        let text = cols[11].trim();
        if text.is_empty() || conf < 0.0 {
            continue;
        }

        paragraphs
            .entry((page_num, block_num, par_num))
            .or_default()
            .push(WordToken {
                line: line_num,
                text: text.to_string(),
                bbox: BBox::new(left, top, width, height),
                conf,
                len: text.chars().count().max(1),
            });
    }

    paragraphs
        .into_values()
        .filter_map(|words| build_region(&words))
        .collect()
}

fn build_region(words: &[WordToken]) -> Option<DetectedText> {
    let mut text = String::new();
    let mut last_token = String::new();
    let mut ordered = words.to_vec();
    ordered.sort_by_key(|word| (word.line, word.bbox.x));
    for word in &ordered {
        if !text.is_empty() && needs_space(&last_token, &word.text) {
            text.push(' ');
        }
        text.push_str(&word.text);
        last_token = word.text.clone();
    }
    let final_text = text.trim();
    if final_text.is_empty() {
        return None;
    }

    let mut bbox: Option<BBox> = None;
    let mut conf_sum = 0.0;
    let mut len_sum = 0.0;
    for word in &ordered {
        bbox = Some(match bbox {
            Some(current) => union_bbox(&current, &word.bbox),
            None => word.bbox,
        });
        let weight = word.len as f32;
        conf_sum += word.conf * weight;
        len_sum += weight;
    }
    let confidence = if len_sum > 0.0 { conf_sum / len_sum } else { 0.0 };

    Some(DetectedText {
        text: final_text.to_string(),
        bbox: bbox?,
        confidence,
    })
}

fn union_bbox(a: &BBox, b: &BBox) -> BBox {
    let x1 = a.x.min(b.x);
    let y1 = a.y.min(b.y);
    let x2 = a.right().max(b.right());
    let y2 = a.bottom().max(b.bottom());
    BBox::new(x1, y1, x2 - x1, y2 - y1)
}

/// Latin words need a separating space; CJK runs do not.
fn needs_space(left: &str, right: &str) -> bool {
    let last = left.chars().rev().find(|ch| !ch.is_whitespace());
    let first = right.chars().find(|ch| !ch.is_whitespace());
    match (last, first) {
        (Some(a), Some(b)) => {
            (a.is_ascii_alphanumeric() || a.is_ascii_punctuation()) && b.is_ascii_alphanumeric()
                || (a.is_alphabetic() && b.is_alphabetic() && !is_cjk(a) && !is_cjk(b))
        }
        _ => false,
    }
}

fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3040..=0x30FF | 0x31F0..=0x31FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF
    )
}
