//! Text detection: a recognition backend loaded once per OCR language, plus
//! validation and reading-order sorting of what it returns.

mod order;
mod parse;
mod tesseract;

use image::RgbaImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::DetectionError;
use crate::page::{BBox, PageId};
use crate::style::ReadingOrder;

pub use tesseract::{DEFAULT_PSM, TesseractBackend, list_tesseract_languages};

pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedText {
    pub text: String,
    pub bbox: BBox,
    pub confidence: f32,
}

/// A loaded recognizer. Loading is expensive, so one instance serves every page
/// of a language.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, image: &RgbaImage) -> anyhow::Result<Vec<DetectedText>>;

    /// Releases backend resources before a re-init.
    fn shutdown(&self) {}
}

pub trait RecognitionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, language: &str) -> anyhow::Result<Arc<dyn Recognizer>>;
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionConfig {
    pub init_timeout: Duration,
    pub min_confidence: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
            min_confidence: 0.0,
        }
    }
}

enum EngineState {
    Idle,
    Ready {
        language: String,
        recognizer: Arc<dyn Recognizer>,
    },
    Failed {
        language: String,
        reason: String,
    },
}

/// Owns the recognizer. A failed init is reported once as `EngineInit`; after
/// that the engine answers `EngineUnavailable` for the same language until
/// [`DetectionEngine::reinitialize`] is called.
pub struct DetectionEngine {
    backend: Arc<dyn RecognitionBackend>,
    config: DetectionConfig,
    state: RwLock<EngineState>,
}

impl DetectionEngine {
    pub fn new(backend: Arc<dyn RecognitionBackend>, config: DetectionConfig) -> Self {
        Self {
            backend,
            config,
            state: RwLock::new(EngineState::Idle),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn language(&self) -> Option<String> {
        match &*self.state.read().await {
            EngineState::Ready { language, .. } => Some(language.clone()),
            _ => None,
        }
    }

    pub async fn failure(&self) -> Option<String> {
        match &*self.state.read().await {
            EngineState::Failed { reason, .. } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Loads the recognizer for `language` unless it is already loaded. A
    /// different language tears the current recognizer down first; the write
    /// lock keeps new detections waiting until the swap is done.
    pub async fn ensure_ready(&self, language: &str) -> Result<(), DetectionError> {
        if let Some(ready) = Self::check(&*self.state.read().await, language) {
            return ready;
        }
        let mut state = self.state.write().await;
        if let Some(ready) = Self::check(&state, language) {
            return ready;
        }
        self.swap_in(&mut state, language).await
    }

    /// Explicit re-init, the only way out of a failed init for the same language.
    pub async fn reinitialize(&self, language: &str) -> Result<(), DetectionError> {
        let mut state = self.state.write().await;
        self.swap_in(&mut state, language).await
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        if let EngineState::Ready { recognizer, language } = &*state {
            debug!("shutting down {} recognizer for '{}'", self.backend.name(), language);
            recognizer.shutdown();
        }
        *state = EngineState::Idle;
    }

    /// Recognizes text on one page and returns it validated and in reading
    /// order. `order` should already be resolved; `Auto` reads left to right.
    pub async fn detect(
        &self,
        page_id: PageId,
        image: Arc<RgbaImage>,
        language: &str,
        order: ReadingOrder,
    ) -> Result<Vec<DetectedText>, DetectionError> {
        self.ensure_ready(language).await?;

        // held until recognition finishes so a re-init cannot swap the recognizer mid-page
        let state = self.state.read().await;
        let recognizer = match &*state {
            EngineState::Ready {
                language: loaded,
                recognizer,
            } if loaded == language => Arc::clone(recognizer),
            _ => {
                return Err(DetectionError::EngineUnavailable {
                    language: language.to_string(),
                });
            }
        };
        let (width, height) = image.dimensions();
        let worker_image = Arc::clone(&image);
        let outcome = tokio::task::spawn_blocking(move || recognizer.recognize(&worker_image)).await;
        drop(state);

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                return Err(DetectionError::Detection {
                    page_id,
                    reason: format!("{:#}", err),
                });
            }
            Err(err) => {
                return Err(DetectionError::Detection {
                    page_id,
                    reason: format!("recognition task failed: {}", err),
                });
            }
        };
        let found = raw.len();
        let kept = order::sanitize(raw, width, height, self.config.min_confidence);
        let ordered = order::reading_order(kept, order);
        debug!(
            "page {}: {} region(s) detected, {} kept",
            page_id,
            found,
            ordered.len()
        );
        Ok(ordered)
    }

    fn check(state: &EngineState, language: &str) -> Option<Result<(), DetectionError>> {
        match state {
            EngineState::Ready { language: loaded, .. } if loaded == language => Some(Ok(())),
            EngineState::Failed { language: failed, .. } if failed == language => {
                Some(Err(DetectionError::EngineUnavailable {
                    language: language.to_string(),
                }))
            }
            _ => None,
        }
    }

    async fn swap_in(&self, state: &mut EngineState, language: &str) -> Result<(), DetectionError> {
        if let EngineState::Ready {
            recognizer,
            language: previous,
        } = &*state
        {
            debug!("tearing down recognizer for '{}'", previous);
            recognizer.shutdown();
        }
        *state = EngineState::Idle;

        match self.load(language).await {
            Ok(recognizer) => {
                info!("{} recognizer ready for '{}'", self.backend.name(), language);
                *state = EngineState::Ready {
                    language: language.to_string(),
                    recognizer,
                };
                Ok(())
            }
            Err(reason) => {
                warn!(
                    "{} recognizer failed to initialize for '{}': {}",
                    self.backend.name(),
                    language,
                    reason
                );
                *state = EngineState::Failed {
                    language: language.to_string(),
                    reason: reason.clone(),
                };
                Err(DetectionError::EngineInit {
                    language: language.to_string(),
                    reason,
                })
            }
        }
    }

    async fn load(&self, language: &str) -> Result<Arc<dyn Recognizer>, String> {
        let backend = Arc::clone(&self.backend);
        let requested = language.to_string();
        let task = tokio::task::spawn_blocking(move || backend.load(&requested));
        match tokio::time::timeout(self.config.init_timeout, task).await {
            Ok(Ok(Ok(recognizer))) => Ok(recognizer),
            Ok(Ok(Err(err))) => Err(format!("{:#}", err)),
            Ok(Err(err)) => Err(format!("init task failed: {}", err)),
            Err(_) => Err(format!(
                "timed out after {}s",
                self.config.init_timeout.as_secs_f32()
            )),
        }
    }
}
