//! Batched, order-preserving translation of a page's region texts.
//!
//! The engine splits a batch into provider-sized chunks, retries failing
//! chunks with bounded backoff, and reconciles whatever comes back into a
//! result exactly as long as the input. Nothing here ever fails a whole batch:
//! unusable output falls back to the source text and is flagged.

mod llm;
mod reconcile;

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::TranslationChunkError;
use crate::providers::retry::next_delay;

pub use llm::{LlmTranslator, TOOL_NAME, render_system_prompt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationItem {
    /// Position in the request, when the provider echoed it back.
    pub index: Option<usize>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub texts: Vec<String>,
    pub source_language: String,
    pub target_language: String,
}

pub type TranslationFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<Vec<TranslationItem>>> + Send>>;

/// One provider call for one chunk. Items may come back short, reordered or
/// indexed; the engine reconciles them.
pub trait TranslationProvider: Send + Sync {
    fn name(&self) -> &str;

    fn translate(&self, request: TranslationRequest) -> TranslationFuture;
}

#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub max_chunk_items: usize,
    pub max_chunk_chars: usize,
    pub call_timeout: Duration,
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            max_chunk_items: 32,
            max_chunk_chars: 6000,
            call_timeout: Duration::from_secs(45),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchTranslation {
    /// Same length and order as the input.
    pub texts: Vec<String>,
    /// Indices that fell back to their source text.
    pub flagged: Vec<usize>,
    #[serde(skip)]
    pub chunk_errors: Vec<TranslationChunkError>,
}

impl BatchTranslation {
    /// True when a provider call failed outright, not merely came back short.
    pub fn has_failed_chunks(&self) -> bool {
        !self.chunk_errors.is_empty()
    }
}

type MemoKey = (String, String, String);

pub struct TranslationEngine {
    provider: Arc<dyn TranslationProvider>,
    config: TranslationConfig,
    memo: HashMap<MemoKey, String>,
}

impl TranslationEngine {
    pub fn new(provider: Arc<dyn TranslationProvider>, config: TranslationConfig) -> Self {
        Self {
            provider,
            config,
            memo: HashMap::new(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn clear_memo(&mut self) {
        self.memo.clear();
    }

    pub async fn translate_batch(
        &mut self,
        texts: &[String],
        source_language: &str,
        target_language: &str,
    ) -> BatchTranslation {
        let mut output = BatchTranslation {
            texts: texts.to_vec(),
            flagged: Vec::new(),
            chunk_errors: Vec::new(),
        };

        // unique texts still needing a provider call, with every position they fill
        let mut pending: Vec<String> = Vec::new();
        let mut positions: Vec<Vec<usize>> = Vec::new();
        for (idx, text) in texts.iter().enumerate() {
            if !needs_provider(text) {
                continue;
            }
            let key = memo_key(source_language, target_language, text);
            if let Some(hit) = self.memo.get(&key) {
                output.texts[idx] = hit.clone();
                continue;
            }
            match pending.iter().position(|existing| existing == text) {
                Some(slot) => positions[slot].push(idx),
                None => {
                    pending.push(text.clone());
                    positions.push(vec![idx]);
                }
            }
        }
        if pending.is_empty() {
            return output;
        }

        let ranges = chunk_ranges(&pending, self.config.max_chunk_items, self.config.max_chunk_chars);
        debug!(
            "translating {} text(s) in {} chunk(s) via {}",
            pending.len(),
            ranges.len(),
            self.provider.name()
        );

        for (chunk, range) in ranges.into_iter().enumerate() {
            let sources = &pending[range.clone()];
            let request = TranslationRequest {
                texts: sources.to_vec(),
                source_language: source_language.to_string(),
                target_language: target_language.to_string(),
            };
            let (translated, fallbacks) = match self.call_with_retry(request).await {
                Ok(items) => reconcile::reconcile(sources, items),
                Err((attempts, reason)) => {
                    let err = TranslationChunkError {
                        chunk,
                        start: range.start,
                        end: range.end,
                        attempts,
                        reason,
                    };
                    warn!("{}", err);
                    output.chunk_errors.push(err);
                    (sources.to_vec(), (0..sources.len()).collect())
                }
            };

            for (offset, text) in translated.into_iter().enumerate() {
                let slot = range.start + offset;
                let fell_back = fallbacks.contains(&offset);
                if !fell_back {
                    self.memo.insert(
                        memo_key(source_language, target_language, &pending[slot]),
                        text.clone(),
                    );
                }
                for &idx in &positions[slot] {
                    output.texts[idx] = text.clone();
                    if fell_back {
                        output.flagged.push(idx);
                    }
                }
            }
        }

        output.flagged.sort_unstable();
        if !output.flagged.is_empty() {
            info!(
                "{} of {} text(s) kept their source text",
                output.flagged.len(),
                texts.len()
            );
        }
        output
    }

    /// Returns the provider items, or the attempt count and last error.
    async fn call_with_retry(
        &self,
        request: TranslationRequest,
    ) -> Result<Vec<TranslationItem>, (usize, String)> {
        let attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.base_delay;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let call = self.provider.translate(request.clone());
            match tokio::time::timeout(self.config.call_timeout, call).await {
                Ok(Ok(items)) => return Ok(items),
                Ok(Err(err)) => last_error = format!("{:#}", err),
                Err(_) => {
                    last_error = format!(
                        "timed out after {:.1}s",
                        self.config.call_timeout.as_secs_f32()
                    )
                }
            }
            if attempt < attempts {
                debug!(
                    "translation attempt {}/{} failed: {}; retrying in {:.1}s",
                    attempt,
                    attempts,
                    last_error,
                    delay.as_secs_f32()
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, self.config.base_delay, self.config.max_delay);
            }
        }
        Err((attempts, last_error))
    }
}

fn memo_key(source_language: &str, target_language: &str, text: &str) -> MemoKey {
    (
        source_language.to_string(),
        target_language.to_string(),
        text.to_string(),
    )
}

/// Only text with at least one letter goes to the provider. Blank, numeric
/// and punctuation-only strings are kept as they are.
pub(crate) fn needs_provider(text: &str) -> bool {
    text.chars().any(char::is_alphabetic)
}

/// Consecutive ranges of at most `max_items` items and `max_chars` characters.
/// An item longer than `max_chars` gets a chunk of its own.
fn chunk_ranges(texts: &[String], max_items: usize, max_chars: usize) -> Vec<Range<usize>> {
    let max_items = max_items.max(1);
    let mut ranges = Vec::new();
    let mut start = 0usize;
    let mut chars = 0usize;
    for (idx, text) in texts.iter().enumerate() {
        let len = text.chars().count();
        let full = idx - start >= max_items || (idx > start && chars + len > max_chars);
        if full {
            ranges.push(start..idx);
            start = idx;
            chars = 0;
        }
        chars += len;
    }
    if start < texts.len() {
        ranges.push(start..texts.len());
    }
    ranges
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Behavior {
        /// `[TGT] text` for every item, indexed, in reverse order.
        Reversed,
        /// Only the first item, un-indexed.
        FirstOnly,
        Fail,
        Hang,
    }

    pub(crate) struct FakeProvider {
        pub behavior: Mutex<Behavior>,
        pub calls: Arc<AtomicUsize>,
        pub seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl FakeProvider {
        pub(crate) fn new(behavior: Behavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                calls: Arc::new(AtomicUsize::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn set_behavior(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }
    }

    impl TranslationProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn translate(&self, request: TranslationRequest) -> TranslationFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.texts.clone());
            let behavior = *self.behavior.lock().unwrap();
            Box::pin(async move {
                let tag = request.target_language.to_uppercase();
                match behavior {
                    Behavior::Reversed => Ok(request
                        .texts
                        .iter()
                        .enumerate()
                        .rev()
                        .map(|(index, text)| TranslationItem {
                            index: Some(index),
                            text: format!("[{}] {}", tag, text),
                        })
                        .collect()),
                    Behavior::FirstOnly => Ok(request
                        .texts
                        .first()
                        .map(|text| TranslationItem {
                            index: None,
                            text: format!("[{}] {}", tag, text),
                        })
                        .into_iter()
                        .collect()),
                    Behavior::Fail => Err(anyhow::anyhow!("provider unavailable")),
                    Behavior::Hang => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(Vec::new())
                    }
                }
            })
        }
    }

    pub(crate) fn quick_config() -> TranslationConfig {
        TranslationConfig {
            max_chunk_items: 4,
            max_chunk_chars: 200,
            call_timeout: Duration::from_millis(50),
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}
