//! Running one generation request against a loaded pipeline

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    generation::{GenerationRequest, ParameterBag},
    pipeline::{ModelHandle, TextGenerationPipeline},
    validation::Validator,
    Result,
};

/// A generation bound to the pipeline it was submitted against.
///
/// The job holds its own reference to the pipeline, so a later load never
/// affects a generation already in flight.
pub struct GenerationJob {
    request: GenerationRequest,
    bag: ParameterBag,
    pipeline: Arc<dyn TextGenerationPipeline>,
}

impl fmt::Debug for GenerationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationJob")
            .field("prompt", &self.request.prompt)
            .field("bag", &self.bag)
            .field("model_id", &self.pipeline.model_id())
            .finish()
    }
}

/// Raw pipeline output with timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOutput {
    pub text: String,
    pub model_id: String,
    pub tokens_generated: usize,
    pub elapsed_ms: u64,
}

impl GenerationJob {
    /// Validate the request and assemble its parameter bag
    pub fn prepare(request: GenerationRequest, handle: &ModelHandle) -> Result<Self> {
        Validator::validate_input_text(&request.prompt)?;
        Validator::validate_generation_params(&request.params)?;

        let pipeline = handle.pipeline();
        let bag = request.params.assemble(pipeline.eos_token_id());
        Ok(Self {
            request,
            bag,
            pipeline,
        })
    }

    pub fn bag(&self) -> &ParameterBag {
        &self.bag
    }

    pub fn prompt(&self) -> &str {
        &self.request.prompt
    }

    /// Run the pipeline. Blocking.
    pub fn execute(&self, cancel: &CancellationToken) -> Result<GenerationOutput> {
        debug!(
            "Generating with {}: {}",
            self.pipeline.model_id(),
            serde_json::Value::Object(self.bag.to_kwargs())
        );
        let start = Instant::now();

        let generated = self.pipeline.generate(&self.request.prompt, &self.bag, cancel)?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            "Generated {} tokens in {} ms",
            generated.tokens_generated, elapsed_ms
        );
        Ok(GenerationOutput {
            text: generated.text,
            model_id: self.pipeline.model_id().to_string(),
            tokens_generated: generated.tokens_generated,
            elapsed_ms,
        })
    }
}
