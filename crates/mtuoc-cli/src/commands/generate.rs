//! One-shot load, generate and filter

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::json;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use mtuoc_core::{
    engine::{EngineUpdate, InferenceEngine, Submission},
    loader::ModelLoader,
    worker::{Dispatcher, WorkerEvent},
    TesterConfig,
};

use crate::commands::{Command, Interrupted};
use crate::utils::{create_spinner, format_duration, print_filter_outcome, print_response};

#[derive(Args, Debug)]
pub struct GenerateCommand {
    /// Prompt text
    #[arg(short, long)]
    pub prompt: String,

    /// Model cache name or folder (defaults to the configured model)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Regex applied to the response
    #[arg(long)]
    pub pattern: Option<String>,

    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    /// Sample instead of beam search
    #[arg(long)]
    pub do_sample: Option<bool>,

    #[arg(long)]
    pub num_beams: Option<usize>,

    #[arg(long)]
    pub repetition_penalty: Option<f32>,

    #[arg(long)]
    pub no_repeat_ngram_size: Option<usize>,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub top_p: Option<f32>,

    /// Seed for reproducible sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Return only the generated continuation, without the prompt
    #[arg(long)]
    pub continuation_only: bool,
}

#[async_trait]
impl Command for GenerateCommand {
    async fn execute(&self, config: &TesterConfig, json_output: bool) -> Result<()> {
        debug!("Executing generate command: {:?}", self);

        let loader = ModelLoader::from_settings(&config.model_settings);
        let (tx, mut events) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(loader.clone(), tx);
        let mut engine = InferenceEngine::new(loader, config);

        for (name, value) in self.overrides() {
            engine
                .set_param(name, &value)
                .map_err(|err| anyhow!(err.summary()))
                .with_context(|| format!("Invalid --{}", name.replace('_', "-")))?;
        }
        if let Some(pattern) = &self.pattern {
            engine.set_pattern(Some(pattern));
        }

        // Load
        let start = Instant::now();
        let submission = engine.submit_load(self.model.as_deref());
        let label = format!("Loading {}...", self.model.as_deref().unwrap_or(engine.default_model()));
        match run_to_completion(&mut engine, &dispatcher, &mut events, submission, &label, json_output).await? {
            EngineUpdate::ModelReady { model_id, device } => {
                info!("Loaded {} on {} in {}", model_id, device, format_duration(start.elapsed()));
            }
            EngineUpdate::ModelFailed(err) => return Err(anyhow!(err)),
            other => bail!("Unexpected load outcome: {:?}", other),
        }

        // Generate
        let submission = engine.submit_generate(&self.prompt);
        let result =
            match run_to_completion(&mut engine, &dispatcher, &mut events, submission, "Generating...", json_output)
                .await?
            {
                EngineUpdate::GenerationCompleted(result) => result,
                EngineUpdate::GenerationFailed(err) => return Err(anyhow!(err)),
                other => bail!("Unexpected generation outcome: {:?}", other),
            };

        // Filter, unless auto-filter already did
        let filtered = match &result.filtered {
            Some(outcome) => Some(outcome.clone()),
            None if !engine.pattern().is_empty() => engine.apply_filter(None),
            None => None,
        };

        if json_output {
            let output = json!({
                "model": result.model_id,
                "prompt": self.prompt,
                "response": result.text,
                "filtered": filtered,
                "tokens_generated": result.tokens_generated,
                "elapsed_ms": result.elapsed_ms,
            });
            println!("{}", serde_json::to_string(&output)?);
        } else {
            print_response(&result, false)?;
            if result.filtered.is_none() {
                if let Some(outcome) = &filtered {
                    print_filter_outcome(outcome, false)?;
                }
            }
        }
        Ok(())
    }
}

impl GenerateCommand {
    /// Parameter overrides given on the command line, as `:set` pairs
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        if let Some(value) = self.max_new_tokens {
            overrides.push(("max_new_tokens", value.to_string()));
        }
        if let Some(value) = self.do_sample {
            overrides.push(("do_sample", value.to_string()));
        }
        if let Some(value) = self.num_beams {
            overrides.push(("num_beams", value.to_string()));
        }
        if let Some(value) = self.repetition_penalty {
            overrides.push(("repetition_penalty", value.to_string()));
        }
        if let Some(value) = self.no_repeat_ngram_size {
            overrides.push(("no_repeat_ngram_size", value.to_string()));
        }
        if let Some(value) = self.temperature {
            overrides.push(("temperature", value.to_string()));
        }
        if let Some(value) = self.top_p {
            overrides.push(("top_p", value.to_string()));
        }
        if let Some(value) = self.seed {
            overrides.push(("seed", value.to_string()));
        }
        if self.continuation_only {
            overrides.push(("return_full_text", "false".to_string()));
        }
        overrides
    }
}

/// Dispatch a submission and wait for its event.
///
/// Ctrl-C cancels a running generation. A load cannot be cancelled, so
/// Ctrl-C during a load ends the command.
async fn run_to_completion(
    engine: &mut InferenceEngine,
    dispatcher: &Dispatcher,
    events: &mut UnboundedReceiver<WorkerEvent>,
    submission: Submission,
    label: &str,
    json_output: bool,
) -> Result<EngineUpdate> {
    match submission {
        Submission::Started(job) => {
            dispatcher.dispatch(job);
        }
        Submission::Rejected(rejection) => bail!("{}", rejection),
        Submission::Ignored => bail!("Prompt is empty"),
    }

    let spinner = (!json_output).then(|| create_spinner(label));
    let update = loop {
        tokio::select! {
            event = events.recv() => {
                let event = event.context("Worker channel closed")?;
                match engine.apply(event) {
                    EngineUpdate::Stale => continue,
                    update => break update,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if let Err(err) = on_interrupt(engine) {
                    if let Some(spinner) = &spinner {
                        spinner.finish_and_clear();
                    }
                    return Err(err);
                }
            }
        }
    };

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    Ok(update)
}

/// Cancel the running generation, or give up when there is nothing to cancel
fn on_interrupt(engine: &mut InferenceEngine) -> Result<()> {
    if engine.cancel() {
        warn!("Interrupted, cancelling generation");
        return Ok(());
    }
    if engine.is_loading() {
        warn!("Interrupted while loading, abandoning the load");
    }
    Err(Interrupted.into())
}
