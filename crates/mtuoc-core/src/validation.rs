//! Input validation for generation parameters, prompts and model folders
//!
//! Validation runs on the interactive side before any background work is
//! started, so mistakes are reported inline instead of failing a worker.

use std::path::{Path, PathBuf};

use crate::{generation::GenerationParams, CoreError, Result};

/// Weight files a model folder may carry, in lookup order
pub const WEIGHT_FILES: &[&str] = &["model.safetensors.index.json", "model.safetensors"];

/// Validation utilities for common operations
pub struct Validator;

impl Validator {
    /// Validate a set of generation parameters
    pub fn validate_generation_params(params: &GenerationParams) -> Result<()> {
        if params.max_new_tokens == 0 {
            return Err(CoreError::invalid_parameter(
                "PARAM_MAX_TOKENS_ZERO",
                "max_new_tokens must be greater than 0",
                "Generation parameter validation",
                "Use a positive value like 256",
                "max_new_tokens",
                params.max_new_tokens.to_string(),
                "1..",
            ));
        }

        if params.num_beams == 0 {
            return Err(CoreError::invalid_parameter(
                "PARAM_NUM_BEAMS_ZERO",
                "num_beams must be greater than 0",
                "Generation parameter validation",
                "Use 1 for greedy decoding or a small beam count like 4",
                "num_beams",
                params.num_beams.to_string(),
                "1..",
            ));
        }

        if !(params.repetition_penalty.is_finite() && params.repetition_penalty > 0.0) {
            return Err(CoreError::invalid_parameter(
                "PARAM_REPETITION_PENALTY_INVALID",
                format!(
                    "repetition_penalty must be a positive number (got: {})",
                    params.repetition_penalty
                ),
                "Generation parameter validation",
                "Use 1.0 for no penalty, values above 1.0 discourage repetition",
                "repetition_penalty",
                params.repetition_penalty.to_string(),
                "(0, inf)",
            ));
        }

        if !(params.temperature.is_finite() && params.temperature > 0.0) {
            return Err(CoreError::invalid_parameter(
                "PARAM_TEMPERATURE_INVALID",
                format!("temperature must be a positive number (got: {})", params.temperature),
                "Generation parameter validation",
                "Use 0.7 for balanced output; disable do_sample for deterministic output",
                "temperature",
                params.temperature.to_string(),
                "(0, inf)",
            ));
        }

        if !(params.top_p > 0.0 && params.top_p <= 1.0) {
            return Err(CoreError::invalid_parameter(
                "PARAM_TOP_P_INVALID",
                format!("top_p must be in (0, 1] (got: {})", params.top_p),
                "Generation parameter validation",
                "Use 0.9 for typical nucleus sampling, 1.0 to disable it",
                "top_p",
                params.top_p.to_string(),
                "(0, 1]",
            ));
        }

        Ok(())
    }

    /// Validate a prompt supplied outside the interactive session
    pub fn validate_input_text(text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(CoreError::invalid_parameter(
                "INPUT_EMPTY",
                "Prompt cannot be empty or whitespace only",
                "Prompt validation",
                "Provide text for the model to continue",
                "prompt",
                text,
                "non-empty",
            ));
        }
        Ok(())
    }

    /// Validate a model folder and return the weight entry point it carries
    pub fn validate_model_dir<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
        let path = path.as_ref();
        let display = path.display().to_string();

        if !path.exists() {
            return Err(CoreError::model_load_for(
                "MODEL_DIR_NOT_FOUND",
                format!("Model folder does not exist: {}", display),
                format!("Attempted to load model from: {}", display),
                "Check the folder path is correct and the model was downloaded",
                display,
            ));
        }

        if !path.is_dir() {
            return Err(CoreError::model_load_for(
                "MODEL_PATH_NOT_DIR",
                format!("Model path is not a folder: {}", display),
                "Models are loaded from a folder holding config, tokenizer and weights",
                "Point to the folder containing config.json, not to a single file",
                display,
            ));
        }

        for required in ["config.json", "tokenizer.json"] {
            if !path.join(required).is_file() {
                return Err(CoreError::model_load_for(
                    "MODEL_FILE_MISSING",
                    format!("Model folder is missing {}", required),
                    format!("Folder: {}", display),
                    "Ensure the model was fully downloaded or exported",
                    display,
                ));
            }
        }

        WEIGHT_FILES
            .iter()
            .map(|name| path.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                CoreError::model_load_for(
                    "MODEL_UNSUPPORTED_FORMAT",
                    "Model folder has no safetensors weights",
                    format!("Folder: {}", display),
                    "Supported weights: model.safetensors or a sharded model.safetensors.index.json",
                    display,
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_validate_generation_params_defaults() {
        assert!(Validator::validate_generation_params(&GenerationParams::default()).is_ok());
    }

    #[test]
    fn test_validate_generation_params_invalid_top_p() {
        let params = GenerationParams {
            top_p: 1.5,
            ..Default::default()
        };
        let err = Validator::validate_generation_params(&params).unwrap_err();
        assert_eq!(err.code(), "PARAM_TOP_P_INVALID");
    }

    #[test]
    fn test_validate_generation_params_zero_beams() {
        let params = GenerationParams {
            num_beams: 0,
            ..Default::default()
        };
        let err = Validator::validate_generation_params(&params).unwrap_err();
        assert_eq!(err.code(), "PARAM_NUM_BEAMS_ZERO");
    }

    #[test]
    fn test_validate_input_text_empty() {
        assert!(Validator::validate_input_text(" \n").is_err());
        assert!(Validator::validate_input_text("Translate this").is_ok());
    }

    #[test]
    fn test_validate_model_dir_not_found() {
        let err = Validator::validate_model_dir("/nonexistent/model").unwrap_err();
        assert_eq!(err.code(), "MODEL_DIR_NOT_FOUND");
    }

    #[test]
    fn test_validate_model_dir_missing_weights() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{}").unwrap();
        fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();

        let err = Validator::validate_model_dir(dir.path()).unwrap_err();
        assert_eq!(err.code(), "MODEL_UNSUPPORTED_FORMAT");

        fs::write(dir.path().join("model.safetensors"), b"weights").unwrap();
        let weights = Validator::validate_model_dir(dir.path()).unwrap();
        assert!(weights.ends_with("model.safetensors"));
    }
}
