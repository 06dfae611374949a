//! Text-generation pipeline abstraction and loaded model handles

pub mod candle;

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{generation::ParameterBag, Result};

pub use self::candle::{BackendSettings, CandleBackend};

/// Compute device a pipeline is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePlacement {
    /// Accelerator with the given ordinal
    Accelerator(usize),
    /// Host processing only
    Host,
}

impl fmt::Display for DevicePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerator(index) => write!(f, "accelerator:{}", index),
            Self::Host => write!(f, "cpu"),
        }
    }
}

/// A resolved model identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Name resolvable through the local model cache registry
    Cached(String),
    /// Folder holding the model artifacts
    Directory(PathBuf),
}

impl ModelSource {
    pub fn display_name(&self) -> String {
        match self {
            Self::Cached(name) => name.clone(),
            Self::Directory(path) => path.display().to_string(),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// A ready-to-run mapping from prompt text to generated text.
///
/// `generate` is blocking and is always called from a worker thread.
pub trait TextGenerationPipeline: Send + Sync {
    /// Identifier the pipeline was loaded from
    fn model_id(&self) -> &str;

    /// Device the pipeline runs on
    fn device(&self) -> DevicePlacement;

    /// End-of-sequence id exposed by the tokenizer or model config
    fn eos_token_id(&self) -> Option<u32>;

    /// Generate text for `prompt`, checking `cancel` between decoding steps
    fn generate(&self, prompt: &str, bag: &ParameterBag, cancel: &CancellationToken) -> Result<GeneratedText>;
}

/// Text produced by one pipeline call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedText {
    pub text: String,
    pub tokens_generated: usize,
}

/// Builds pipelines from resolved model sources.
///
/// The backend picks the device; `load` is blocking and runs on a worker.
pub trait ModelBackend: Send + Sync {
    fn load(&self, source: &ModelSource) -> Result<Arc<dyn TextGenerationPipeline>>;
}

/// A loaded pipeline. Replaced wholesale on every load, never mutated.
#[derive(Clone)]
pub struct ModelHandle {
    pipeline: Arc<dyn TextGenerationPipeline>,
    source: ModelSource,
    loaded_at: DateTime<Utc>,
}

impl ModelHandle {
    pub fn new(pipeline: Arc<dyn TextGenerationPipeline>, source: ModelSource) -> Self {
        Self {
            pipeline,
            source,
            loaded_at: Utc::now(),
        }
    }

    pub fn pipeline(&self) -> Arc<dyn TextGenerationPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    pub fn device(&self) -> DevicePlacement {
        self.pipeline.device()
    }

    pub fn model_id(&self) -> &str {
        self.pipeline.model_id()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id())
            .field("device", &self.device())
            .field("source", &self.source)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}
