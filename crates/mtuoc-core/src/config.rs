//! Tester configuration read once at startup

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{generation::GenerationParams, validation::Validator, CoreError, Result};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Top-level configuration file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterConfig {
    /// Which model to show and load
    pub model_settings: ModelSettings,

    /// Filter defaults
    #[serde(default)]
    pub prompt_settings: PromptSettings,

    /// Default generation parameters
    #[serde(default)]
    pub generation: GenerationParams,
}

/// Model selection and placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Display name, also the default identifier to load
    pub name: String,

    /// Identifier or folder to load instead of `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default)]
    pub device: DevicePreference,

    #[serde(default)]
    pub accelerator_index: usize,

    /// Extra folders scanned for local models
    #[serde(default)]
    pub model_dirs: Vec<PathBuf>,

    /// Hub cache location, defaults to the standard Hugging Face cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Fetch files missing from the cache from the hub
    #[serde(default)]
    pub allow_download: bool,

    #[serde(default = "default_true")]
    pub load_on_startup: bool,
}

impl ModelSettings {
    /// Identifier loaded when none is given explicitly
    pub fn default_identifier(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// Where the pipeline should run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// First accelerator if one is present, host otherwise
    #[default]
    Auto,
    /// Always run on the host
    Cpu,
}

/// Post-filter defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSettings {
    /// Default pattern; the literal "None" or an empty string mean none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_pattern: Option<String>,

    /// Filter the response as soon as a generation completes
    #[serde(default = "default_true")]
    pub auto_filter: bool,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            regex_pattern: None,
            auto_filter: true,
        }
    }
}

impl PromptSettings {
    pub fn default_pattern(&self) -> Option<&str> {
        self.regex_pattern
            .as_deref()
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty() && *pattern != "None")
    }
}

fn default_true() -> bool {
    true
}

impl TesterConfig {
    /// Load configuration from `path`, or from [`DEFAULT_CONFIG_FILE`].
    ///
    /// A missing or invalid file is a configuration error; there is no
    /// fallback to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        if !path.is_file() {
            return Err(CoreError::configuration_with_path(
                "CONFIG_NOT_FOUND",
                format!("Configuration file not found: {}", path.display()),
                "Reading startup configuration",
                "Create the file (see config.example.toml) or pass --config",
                path,
            ));
        }

        let content = std::fs::read_to_string(&path).map_err(|err| {
            CoreError::configuration_with_path(
                "CONFIG_UNREADABLE",
                format!("Failed to read config file {}: {}", path.display(), err),
                "Reading startup configuration",
                "Check file permissions",
                path.clone(),
            )
        })?;

        let config = Self::from_toml(&content).map_err(|err| match err {
            CoreError::Configuration {
                code,
                message,
                context,
                suggestion,
                ..
            } => CoreError::Configuration {
                code,
                message,
                context,
                suggestion,
                config_path: Some(path.clone()),
            },
            other => other,
        })?;

        debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: TesterConfig = toml::from_str(content).map_err(|err| {
            CoreError::configuration(
                "CONFIG_INVALID",
                format!("Failed to parse configuration: {}", err),
                "Parsing TOML configuration",
                "Check the [model_settings] table and its name entry",
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.model_settings.name.trim().is_empty() {
            return Err(CoreError::configuration(
                "CONFIG_MODEL_NAME_EMPTY",
                "model_settings.name must not be empty",
                "Validating configuration",
                "Set the model name to show and load",
            ));
        }

        Validator::validate_generation_params(&self.generation).map_err(|err| {
            CoreError::configuration(
                "CONFIG_GENERATION_INVALID",
                err.summary(),
                "Validating [generation] defaults",
                "Fix the generation parameter in the configuration file",
            )
        })
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| {
            CoreError::internal("CONFIG_SERIALIZE_FAILED", err.to_string(), "Serializing configuration")
        })
    }
}
