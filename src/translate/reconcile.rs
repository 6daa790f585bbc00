use super::TranslationItem;

/// Aligns provider items with `sources`. Indexed items go to their index
/// (out of range or already filled is ignored); un-indexed items go to their
/// position in the response. Slots left empty or blank fall back to the
/// source text and are returned in the second vector.
pub(crate) fn reconcile(sources: &[String], items: Vec<TranslationItem>) -> (Vec<String>, Vec<usize>) {
    let mut slots: Vec<Option<String>> = vec![None; sources.len()];

    let usable = |text: &str| !text.trim().is_empty();
    let mut positional = Vec::new();
    for (position, item) in items.into_iter().enumerate() {
        match item.index {
            Some(index) => {
                if let Some(slot) = slots.get_mut(index)
                    && slot.is_none()
                    && usable(&item.text)
                {
                    *slot = Some(item.text);
                }
            }
            None => positional.push((position, item.text)),
        }
    }
    for (position, text) in positional {
        if let Some(slot) = slots.get_mut(position)
            && slot.is_none()
            && usable(&text)
        {
            *slot = Some(text);
        }
    }

    let mut fallbacks = Vec::new();
    let texts = slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.unwrap_or_else(|| {
                fallbacks.push(idx);
                sources[idx].clone()
            })
        })
        .collect();
    (texts, fallbacks)
}
