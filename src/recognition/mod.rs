//! Text recognition.
//!
//! A [`RecognitionAdapter`] wraps exactly one [`RecognitionBackend`], chosen
//! from [`RecognitionConfig`]. Backends report raw text fragments, and the
//! adapter turns them into a single [`RecognitionResult`].
//!
//! Recognition never fails from the caller's point of view: a backend error
//! becomes an empty result with zero confidence and an `error` entry in the
//! metadata. Only backend construction can fail.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use schemars::JsonSchema;
use serde_json::{Map, json};

use crate::{
    async_utils::io::JsonObject, config::RecognitionConfig, errors::PipelineError,
    prelude::*, raster::Raster,
};

pub mod tesseract;
pub mod textract;

/// A piece of recognized text, with the backend's confidence in `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub confidence: f64,
}

impl Fragment {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Interface implemented by OCR engines.
#[async_trait]
pub trait RecognitionBackend: Send + Sync + 'static {
    /// Name used in logs and result metadata.
    fn name(&self) -> &'static str;

    /// How to join fragments into a single text.
    fn separator(&self) -> &'static str {
        " "
    }

    /// Find text fragments in an image, in reading order.
    async fn detect(&self, image: &Raster) -> Result<Vec<Fragment>>;
}

/// The result of recognizing one image.
#[derive(Clone, Debug, Serialize, JsonSchema, PartialEq)]
pub struct RecognitionResult {
    /// The recognized text.
    pub text: String,

    /// Mean fragment confidence, in `[0, 1]`. Exactly 0 if nothing was found.
    pub confidence: f64,

    /// Backend name, timing, and any error.
    pub metadata: JsonObject,
}

impl RecognitionResult {
    /// Combine fragments into a single result.
    pub fn from_fragments(fragments: &[Fragment], separator: &str) -> Self {
        let text = fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(separator);
        let confidence = if fragments.is_empty() {
            0.0
        } else {
            let sum: f64 = fragments.iter().map(|f| f.confidence).sum();
            (sum / fragments.len() as f64).clamp(0.0, 1.0)
        };
        let mut metadata = Map::new();
        metadata.insert("fragment_count".to_owned(), json!(fragments.len()));
        Self {
            text,
            confidence,
            metadata,
        }
    }

    /// An empty result recording why recognition failed.
    pub fn failed(error: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("error".to_owned(), Value::String(error.into()));
        Self {
            text: String::new(),
            confidence: 0.0,
            metadata,
        }
    }

    /// The error message, if recognition failed.
    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }
}

/// Runs recognition through the configured backend.
#[derive(Clone)]
pub struct RecognitionAdapter {
    backend: Arc<dyn RecognitionBackend>,
}

impl RecognitionAdapter {
    /// Create the backend named by `config`. Fails if the backend's models,
    /// binaries or credentials aren't available.
    pub async fn new(config: &RecognitionConfig) -> Result<Self, PipelineError> {
        let backend: Arc<dyn RecognitionBackend> = match config {
            RecognitionConfig::LocalModel { languages, gpu } => {
                Arc::new(tesseract::TesseractBackend::new(languages, *gpu).await?)
            }
            RecognitionConfig::RemoteService {
                credentials_path,
                rate_limit,
            } => Arc::new(
                textract::TextractBackend::new(
                    credentials_path.as_deref(),
                    rate_limit.as_ref(),
                )
                .await?,
            ),
        };
        info!(
            engine = config.engine_name(),
            backend = backend.name(),
            "Recognition backend ready"
        );
        Ok(Self { backend })
    }

    /// Wrap an existing backend.
    #[cfg(test)]
    pub fn from_backend(backend: Arc<dyn RecognitionBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Recognize text in one image.
    #[instrument(level = "debug", skip_all, fields(backend = self.backend.name()))]
    pub async fn recognize(&self, image: &Raster) -> RecognitionResult {
        self.recognize_with_timeout(image, None).await
    }

    /// Like [`Self::recognize`], but treat a call that takes longer than
    /// `timeout` as a failure.
    pub async fn recognize_with_timeout(
        &self,
        image: &Raster,
        timeout: Option<Duration>,
    ) -> RecognitionResult {
        let start = Instant::now();
        let detection = self.backend.detect(image);
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, detection).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!("recognition timed out after {limit:?}")),
            },
            None => detection.await,
        };
        let mut result = match outcome {
            Ok(fragments) => {
                RecognitionResult::from_fragments(&fragments, self.backend.separator())
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(backend = self.backend.name(), error = %message, "Recognition failed");
                RecognitionResult::failed(message)
            }
        };
        result
            .metadata
            .insert("backend".to_owned(), json!(self.backend.name()));
        result.metadata.insert(
            "processing_time_secs".to_owned(),
            json!(start.elapsed().as_secs_f64()),
        );
        debug!(
            confidence = result.confidence,
            chars = result.text.len(),
            "Recognition finished"
        );
        result
    }

    /// Recognize several images, one at a time, in order.
    pub async fn recognize_batch(&self, images: &[Raster]) -> Vec<RecognitionResult> {
        let mut results = Vec::with_capacity(images.len());
        for image in images {
            results.push(self.recognize(image).await);
        }
        results
    }
}

/// A backend that returns canned fragments, for tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub struct FakeBackend {
        pub fragments: Vec<Fragment>,
        pub fail_with: Option<String>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
    }

    impl FakeBackend {
        pub fn returning(fragments: &[(&str, f64)]) -> Self {
            Self {
                fragments: fragments
                    .iter()
                    .map(|(text, conf)| Fragment::new(*text, *conf))
                    .collect(),
                fail_with: None,
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_owned()),
                ..Self::returning(&[])
            }
        }
    }

    #[async_trait]
    impl RecognitionBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn detect(&self, _image: &Raster) -> Result<Vec<Fragment>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.fail_with {
                Some(message) => Err(anyhow!("{message}")),
                None => Ok(self.fragments.clone()),
            }
        }
    }
}
