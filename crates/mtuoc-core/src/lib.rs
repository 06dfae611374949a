//! MTUOC Core - model loading, generation and post-filtering
//!
//! This crate holds everything behind the tester's interactive surface:
//! resolving and loading a text-generation pipeline, marshalling generation
//! parameters, running decoding off the interactive thread and filtering the
//! raw response with a regular expression.

// Module declarations
pub mod config;
pub mod decoding;
pub mod discovery;
pub mod engine;
pub mod filter;
pub mod generation;
pub mod invoker;
pub mod loader;
pub mod pipeline;
pub mod validation;
pub mod worker;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Startup configuration missing or unusable
    #[error("Configuration error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        config_path: Option<PathBuf>,
    },

    /// Model resolution or loading errors
    #[error("Model load error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    ModelLoad {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        model_id: Option<String>,
    },

    /// Text generation and inference errors
    #[error("Generation error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Generation {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
    },

    /// Malformed post-filter expression
    #[error("Invalid filter pattern [{code}]: {message}")]
    FilterPattern {
        code: &'static str,
        message: String,
        pattern: String,
    },

    /// Input validation and parameter errors
    #[error("Invalid input [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    InvalidInput {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        parameter_name: Option<String>,
        value: Option<String>,
        valid_range: Option<String>,
    },

    /// File system and I/O errors
    #[error("IO error [{code}]: {message}\nPath: {path:?}\nSuggestion: {suggestion}")]
    Io {
        code: &'static str,
        message: String,
        path: Option<PathBuf>,
        suggestion: String,
        #[source]
        source: std::io::Error,
    },

    /// Other unexpected errors
    #[error("Internal error [{code}]: {message}\nContext: {context}")]
    Internal {
        code: &'static str,
        message: String,
        context: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse classification used by the interactive surface to decide how an
/// error is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at startup
    ConfigurationMissing,
    ModelLoadFailure,
    GenerationFailure,
    FilterPatternInvalid,
    InvalidInput,
    Io,
    Internal,
}

impl CoreError {
    /// Create a configuration error
    pub fn configuration<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            config_path: None,
        }
    }

    /// Create a configuration error tied to a file
    pub fn configuration_with_path<S1, S2, S3, P>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
        path: P,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        P: Into<PathBuf>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            config_path: Some(path.into()),
        }
    }

    /// Create a model load error
    pub fn model_load<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::ModelLoad {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            model_id: None,
        }
    }

    /// Create a model load error for a specific model identifier
    pub fn model_load_for<S1, S2, S3, S4>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
        model_id: S4,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self::ModelLoad {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            model_id: Some(model_id.into()),
        }
    }

    /// Create a generation error
    pub fn generation<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Generation {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a filter pattern error
    pub fn filter_pattern<S1, S2>(code: &'static str, message: S1, pattern: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::FilterPattern {
            code,
            message: message.into(),
            pattern: pattern.into(),
        }
    }

    /// Create an invalid input error with parameter validation details
    pub fn invalid_parameter<S1, S2, S3, S4, S5, S6>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
        param_name: S4,
        value: S5,
        valid_range: S6,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
        S5: Into<String>,
        S6: Into<String>,
    {
        Self::InvalidInput {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            parameter_name: Some(param_name.into()),
            value: Some(value.into()),
            valid_range: Some(valid_range.into()),
        }
    }

    /// Create an internal error
    pub fn internal<S1, S2>(code: &'static str, message: S1, context: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Internal {
            code,
            message: message.into(),
            context: context.into(),
            source: None,
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { code, .. } => code,
            Self::ModelLoad { code, .. } => code,
            Self::Generation { code, .. } => code,
            Self::FilterPattern { code, .. } => code,
            Self::InvalidInput { code, .. } => code,
            Self::Io { code, .. } => code,
            Self::Internal { code, .. } => code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::ConfigurationMissing,
            Self::ModelLoad { .. } => ErrorKind::ModelLoadFailure,
            Self::Generation { .. } => ErrorKind::GenerationFailure,
            Self::FilterPattern { .. } => ErrorKind::FilterPatternInvalid,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Io { .. } => ErrorKind::Io,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// One-line description for inline display, without the suggestion block
    pub fn summary(&self) -> String {
        match self {
            Self::Configuration { message, .. }
            | Self::ModelLoad { message, .. }
            | Self::Generation { message, .. }
            | Self::FilterPattern { message, .. }
            | Self::InvalidInput { message, .. }
            | Self::Io { message, .. }
            | Self::Internal { message, .. } => message.clone(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        let (code, suggestion) = match err.kind() {
            std::io::ErrorKind::NotFound => (
                "IO_FILE_NOT_FOUND",
                "Check that the file path is correct and the file exists",
            ),
            std::io::ErrorKind::PermissionDenied => (
                "IO_PERMISSION_DENIED",
                "Check file permissions or run with appropriate privileges",
            ),
            std::io::ErrorKind::InvalidData => (
                "IO_INVALID_DATA",
                "The file may be corrupted or in an unexpected format",
            ),
            _ => (
                "IO_UNKNOWN",
                "Check the file system and try the operation again",
            ),
        };

        Self::Io {
            code,
            message: err.to_string(),
            path: None,
            suggestion: suggestion.to_string(),
            source: err,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            code: "INTERNAL_UNKNOWN",
            message: err.to_string(),
            context: "An unexpected error occurred".to_string(),
            source: Some(err),
        }
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        config::{DevicePreference, ModelSettings, PromptSettings, TesterConfig},
        decoding::LogitsSource,
        discovery::{DiscoveredModel, ModelOrigin},
        engine::{EngineUpdate, InferenceEngine, ModelStatus, Rejection, Submission},
        filter::{FilterOutcome, PostFilter},
        generation::{DecodingStrategy, GenerationParams, GenerationRequest, GenerationResult, ParameterBag},
        invoker::{GenerationJob, GenerationOutput},
        loader::{LoadPermit, ModelLoader},
        pipeline::{DevicePlacement, ModelBackend, ModelHandle, ModelSource, TextGenerationPipeline},
        worker::{Dispatcher, Job, WorkerEvent},
        CoreError, ErrorKind, Result,
    };
}

// Re-export key types at the crate root
pub use config::TesterConfig;
pub use engine::InferenceEngine;
pub use filter::{FilterOutcome, PostFilter};
pub use generation::{GenerationParams, ParameterBag};
pub use pipeline::{ModelBackend, ModelHandle, TextGenerationPipeline};
