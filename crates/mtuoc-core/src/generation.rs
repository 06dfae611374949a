//! Generation parameters, the assembled parameter bag and generation results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{filter::FilterOutcome, validation::Validator, CoreError, Result};

/// Eos/pad id used when neither the model config nor the tokenizer name one
pub const DEFAULT_EOS_TOKEN_ID: u32 = 2;

/// User-settable generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_new_tokens: usize,

    /// Sample instead of beam/greedy search
    pub do_sample: bool,

    /// Beam count, only used when `do_sample` is false
    pub num_beams: usize,

    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,

    /// Forbid repeating n-grams of this size (0 = disabled)
    pub no_repeat_ngram_size: usize,

    /// Temperature for sampling, only used when `do_sample` is true
    pub temperature: f32,

    /// Top-p (nucleus) sampling threshold, only used when `do_sample` is true
    pub top_p: f32,

    /// Random seed for reproducible sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Prepend the prompt to the returned text
    pub return_full_text: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            do_sample: false,
            num_beams: 4,
            repetition_penalty: 1.2,
            no_repeat_ngram_size: 3,
            temperature: 0.7,
            top_p: 0.9,
            seed: None,
            return_full_text: true,
        }
    }
}

/// Names accepted by [`GenerationParams::set`]
pub const PARAMETER_NAMES: &[&str] = &[
    "max_new_tokens",
    "do_sample",
    "num_beams",
    "repetition_penalty",
    "no_repeat_ngram_size",
    "temperature",
    "top_p",
    "seed",
    "return_full_text",
];

impl GenerationParams {
    /// Build the parameter bag handed to the pipeline.
    ///
    /// Exactly one decoding branch is attached: sampling parameters when
    /// `do_sample` is set, the beam count otherwise.
    pub fn assemble(&self, eos_token_id: Option<u32>) -> ParameterBag {
        let strategy = if self.do_sample {
            DecodingStrategy::Sampling {
                temperature: self.temperature,
                top_p: self.top_p,
                seed: self.seed,
            }
        } else {
            DecodingStrategy::BeamSearch {
                num_beams: self.num_beams,
            }
        };

        ParameterBag {
            max_new_tokens: self.max_new_tokens,
            repetition_penalty: self.repetition_penalty,
            no_repeat_ngram_size: self.no_repeat_ngram_size,
            eos_token_id: eos_token_id.unwrap_or(DEFAULT_EOS_TOKEN_ID),
            do_sample: self.do_sample,
            return_full_text: self.return_full_text,
            strategy,
        }
    }

    /// Update a single parameter from its textual form.
    ///
    /// The update is validated as a whole; on failure the parameters are
    /// left as they were.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        let value = value.trim();

        match name {
            "max_new_tokens" => updated.max_new_tokens = parse_value(name, value)?,
            "do_sample" => updated.do_sample = parse_bool(name, value)?,
            "num_beams" => updated.num_beams = parse_value(name, value)?,
            "repetition_penalty" => updated.repetition_penalty = parse_value(name, value)?,
            "no_repeat_ngram_size" => updated.no_repeat_ngram_size = parse_value(name, value)?,
            "temperature" => updated.temperature = parse_value(name, value)?,
            "top_p" => updated.top_p = parse_value(name, value)?,
            "seed" => {
                updated.seed = match value {
                    "" | "none" | "None" => None,
                    _ => Some(parse_value(name, value)?),
                }
            }
            "return_full_text" => updated.return_full_text = parse_bool(name, value)?,
            _ => {
                return Err(CoreError::invalid_parameter(
                    "PARAM_UNKNOWN",
                    format!("Unknown generation parameter: {}", name),
                    "Updating generation parameters",
                    format!("Known parameters: {}", PARAMETER_NAMES.join(", ")),
                    name,
                    value,
                    "n/a",
                ))
            }
        }

        Validator::validate_generation_params(&updated)?;
        *self = updated;
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        CoreError::invalid_parameter(
            "PARAM_PARSE_FAILED",
            format!("Could not parse '{}' for {}", value, name),
            "Updating generation parameters",
            "Provide a numeric value",
            name,
            value,
            "numeric",
        )
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(CoreError::invalid_parameter(
            "PARAM_PARSE_FAILED",
            format!("Could not parse '{}' for {}", value, name),
            "Updating generation parameters",
            "Use true or false",
            name,
            value,
            "true | false",
        )),
    }
}

/// A prompt together with the parameters it should be generated with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// Create a request, returning `None` for an empty or whitespace-only prompt
    pub fn new(prompt: &str, params: GenerationParams) -> Option<Self> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return None;
        }
        Some(Self {
            prompt: prompt.to_string(),
            params,
        })
    }
}

/// Decoding branch attached to a parameter bag
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodingStrategy {
    /// Deterministic search; a single beam is plain greedy decoding
    BeamSearch { num_beams: usize },

    /// Nucleus sampling shaped by temperature
    Sampling {
        temperature: f32,
        top_p: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },
}

/// Keyword arguments for one pipeline call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterBag {
    pub max_new_tokens: usize,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub eos_token_id: u32,
    pub do_sample: bool,
    pub return_full_text: bool,
    #[serde(flatten)]
    pub strategy: DecodingStrategy,
}

impl ParameterBag {
    /// Render the bag as a JSON object, e.g. for logging
    pub fn to_kwargs(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// Output of a successful generation plus its derived filter result
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    /// Raw text as returned by the pipeline
    pub text: String,

    /// Model the text was generated with
    pub model_id: String,

    /// Number of tokens generated
    pub tokens_generated: usize,

    /// Total generation time (ms)
    pub elapsed_ms: u64,

    pub completed_at: DateTime<Utc>,

    /// Filter matches derived from `text`, recomputed on demand
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered: Option<FilterOutcome>,
}
