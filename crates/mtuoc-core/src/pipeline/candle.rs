//! Candle-backed text-generation pipeline for Llama-architecture checkpoints
//!
//! Artifacts come either from a model folder or from the Hugging Face hub
//! cache (optionally downloading what is missing). Decoding itself lives in
//! [`crate::decoding`]; this module only runs forward passes.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::{
    api::sync::{Api, ApiBuilder},
    Cache as HubCache, Repo, RepoType,
};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokenizers::Tokenizer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DevicePlacement, GeneratedText, ModelBackend, ModelSource, TextGenerationPipeline};
use crate::{
    config::{DevicePreference, ModelSettings},
    decoding::{self, LogitsSource},
    generation::ParameterBag,
    validation::Validator,
    CoreError, Result,
};

/// `model_type` values the Llama implementation can run
pub const SUPPORTED_MODEL_TYPES: &[&str] = &["llama"];

/// Tokens tried, in order, when the model config names no eos id
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>", "<|eot_id|>"];

/// Backend settings derived from `[model_settings]`
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub device: DevicePreference,
    pub accelerator_index: usize,
    pub cache_dir: Option<PathBuf>,
    pub allow_download: bool,
}

impl BackendSettings {
    pub fn from_model_settings(settings: &ModelSettings) -> Self {
        Self {
            device: settings.device,
            accelerator_index: settings.accelerator_index,
            cache_dir: settings.cache_dir.clone(),
            allow_download: settings.allow_download,
        }
    }

    /// Hub cache in use, honouring `cache_dir` and `HF_HOME`
    pub fn hub_cache(&self) -> HubCache {
        match &self.cache_dir {
            Some(dir) => HubCache::new(dir.clone()),
            None => HubCache::default(),
        }
    }
}

/// Loads Llama checkpoints with candle
pub struct CandleBackend {
    settings: BackendSettings,
}

impl CandleBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl ModelBackend for CandleBackend {
    fn load(&self, source: &ModelSource) -> Result<Arc<dyn TextGenerationPipeline>> {
        let model_id = source.display_name();
        let start = Instant::now();
        let store = ArtifactStore::open(source, &self.settings)?;

        let config_path = store.require("config.json")?;
        let tokenizer_path = store.require("tokenizer.json")?;
        let raw_config = std::fs::read(&config_path)?;
        check_architecture(&raw_config, &model_id)?;

        let llama_config: LlamaConfig = serde_json::from_slice(&raw_config).map_err(|err| {
            CoreError::model_load_for(
                "MODEL_CONFIG_INVALID",
                format!("Failed to parse config.json: {}", err),
                format!("Config: {}", config_path.display()),
                "The checkpoint does not look like a Llama-architecture model",
                model_id.as_str(),
            )
        })?;
        let config = llama_config.into_config(false);

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
            CoreError::model_load_for(
                "MODEL_TOKENIZER_INVALID",
                format!("Failed to load tokenizer: {}", err),
                format!("Tokenizer: {}", tokenizer_path.display()),
                "Re-export or re-download tokenizer.json",
                model_id.as_str(),
            )
        })?;

        let weights = store.weight_files()?;
        let (device, placement) = select_device(&self.settings);
        let dtype = match placement {
            DevicePlacement::Host => DType::F32,
            DevicePlacement::Accelerator(_) => DType::F16,
        };
        debug!(
            "Loading {} weight file(s) for {} as {:?} on {}",
            weights.len(),
            model_id,
            dtype,
            placement
        );

        // SAFETY: the weight files are memory-mapped read-only and stay on
        // disk for the lifetime of the mapping.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device) }
            .map_err(|err| load_error(&model_id, err))?;
        let model = Llama::load(vb, &config).map_err(|err| load_error(&model_id, err))?;

        let eos_token_id = eos_from_config(&config).or_else(|| eos_from_tokenizer(&tokenizer));
        info!(
            "Loaded {} on {} in {:.2}s",
            model_id,
            placement,
            start.elapsed().as_secs_f64()
        );

        Ok(Arc::new(CandlePipeline {
            model_id,
            model,
            config,
            tokenizer,
            device,
            dtype,
            placement,
            eos_token_id,
        }))
    }
}

/// Where a model's files are read from
enum ArtifactStore {
    Directory(PathBuf),
    Hub {
        cache: HubCache,
        api: Option<Api>,
        repo: Repo,
    },
}

impl ArtifactStore {
    fn open(source: &ModelSource, settings: &BackendSettings) -> Result<Self> {
        match source {
            ModelSource::Directory(path) => {
                Validator::validate_model_dir(path)?;
                Ok(Self::Directory(path.clone()))
            }
            ModelSource::Cached(name) => {
                let cache = settings.hub_cache();
                let repo = Repo::new(name.clone(), RepoType::Model);

                let api = if settings.allow_download {
                    let api = ApiBuilder::new()
                        .with_cache_dir(cache.path().clone())
                        .build()
                        .map_err(|err| load_error(name, err))?;
                    Some(api)
                } else {
                    None
                };

                if api.is_none() && cache.repo(repo.clone()).get("config.json").is_none() {
                    return Err(CoreError::model_load_for(
                        "MODEL_NOT_CACHED",
                        format!("Model '{}' is not in the local model cache", name),
                        format!("Cache: {}", cache.path().display()),
                        "Download the model first, point to its folder, or set allow_download = true",
                        name.as_str(),
                    ));
                }

                Ok(Self::Hub { cache, api, repo })
            }
        }
    }

    fn fetch(&self, file: &str) -> Result<Option<PathBuf>> {
        match self {
            Self::Directory(dir) => {
                let path = dir.join(file);
                Ok(path.is_file().then_some(path))
            }
            Self::Hub { cache, api, repo } => {
                if let Some(path) = cache.repo(repo.clone()).get(file) {
                    return Ok(Some(path));
                }
                match api {
                    Some(api) => match api.repo(repo.clone()).get(file) {
                        Ok(path) => Ok(Some(path)),
                        Err(err) => {
                            debug!("Hub fetch of {} for {} failed: {}", file, repo.url(), err);
                            Ok(None)
                        }
                    },
                    None => Ok(None),
                }
            }
        }
    }

    fn require(&self, file: &str) -> Result<PathBuf> {
        self.fetch(file)?.ok_or_else(|| {
            CoreError::model_load_for(
                "MODEL_FILE_MISSING",
                format!("Model is missing {}", file),
                format!("Source: {}", self.describe()),
                "Ensure the model was fully downloaded or exported",
                self.describe(),
            )
        })
    }

    fn weight_files(&self) -> Result<Vec<PathBuf>> {
        match self.fetch("model.safetensors.index.json")? {
            Some(index) => {
                let shards = shard_names(&index)?;
                shards.iter().map(|shard| self.require(shard)).collect()
            }
            None => Ok(vec![self.require("model.safetensors")?]),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Directory(dir) => dir.display().to_string(),
            Self::Hub { repo, .. } => repo.url(),
        }
    }
}

/// Shard file names listed by a safetensors index, deduplicated
fn shard_names(index: &Path) -> Result<Vec<String>> {
    let content = std::fs::read(index)?;
    let value: serde_json::Value = serde_json::from_slice(&content).map_err(|err| {
        CoreError::model_load(
            "MODEL_INDEX_INVALID",
            format!("Failed to parse weight index: {}", err),
            format!("Index: {}", index.display()),
            "Re-download model.safetensors.index.json",
        )
    })?;

    let shards: BTreeSet<String> = value
        .get("weight_map")
        .and_then(|map| map.as_object())
        .map(|map| {
            map.values()
                .filter_map(|file| file.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if shards.is_empty() {
        return Err(CoreError::model_load(
            "MODEL_INDEX_EMPTY",
            "Weight index lists no shards",
            format!("Index: {}", index.display()),
            "Re-download model.safetensors.index.json",
        ));
    }
    Ok(shards.into_iter().collect())
}

fn check_architecture(raw_config: &[u8], model_id: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_slice(raw_config).map_err(|err| {
        CoreError::model_load_for(
            "MODEL_CONFIG_INVALID",
            format!("config.json is not valid JSON: {}", err),
            "Checking model architecture",
            "Re-download config.json",
            model_id,
        )
    })?;

    match value.get("model_type").and_then(|t| t.as_str()) {
        Some(model_type) if !SUPPORTED_MODEL_TYPES.contains(&model_type) => Err(CoreError::model_load_for(
            "MODEL_INCOMPATIBLE",
            format!("Unsupported model_type '{}'", model_type),
            "Checking model architecture",
            format!("Supported architectures: {}", SUPPORTED_MODEL_TYPES.join(", ")),
            model_id,
        )),
        _ => Ok(()),
    }
}

fn select_device(settings: &BackendSettings) -> (Device, DevicePlacement) {
    if settings.device == DevicePreference::Cpu {
        return (Device::Cpu, DevicePlacement::Host);
    }

    let index = settings.accelerator_index;
    if candle_core::utils::cuda_is_available() {
        match Device::new_cuda(index) {
            Ok(device) => return (device, DevicePlacement::Accelerator(index)),
            Err(err) => warn!("CUDA device {} unavailable ({}), falling back", index, err),
        }
    }
    if candle_core::utils::metal_is_available() {
        match Device::new_metal(index) {
            Ok(device) => return (device, DevicePlacement::Accelerator(index)),
            Err(err) => warn!("Metal device {} unavailable ({}), falling back", index, err),
        }
    }
    (Device::Cpu, DevicePlacement::Host)
}

fn eos_from_config(config: &Config) -> Option<u32> {
    match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => Some(*id),
        Some(LlamaEosToks::Multiple(ids)) => ids.first().copied(),
        None => None,
    }
}

fn eos_from_tokenizer(tokenizer: &Tokenizer) -> Option<u32> {
    EOS_CANDIDATES
        .iter()
        .find_map(|token| tokenizer.token_to_id(token))
}

fn load_error(model_id: &str, err: impl Display) -> CoreError {
    CoreError::model_load_for(
        "MODEL_LOAD_FAILED",
        format!("Failed to load model: {}", err),
        format!("Model: {}", model_id),
        "Check the weights are complete and that enough memory is available",
        model_id,
    )
}

fn inference_error(err: impl Display) -> CoreError {
    CoreError::generation(
        "INFERENCE_FAILED",
        format!("Inference failed: {}", err),
        "Running the model forward pass",
        "Try fewer max_new_tokens or a shorter prompt",
    )
}

/// A loaded Llama model with its tokenizer
pub struct CandlePipeline {
    model_id: String,
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    placement: DevicePlacement,
    eos_token_id: Option<u32>,
}

impl TextGenerationPipeline for CandlePipeline {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device(&self) -> DevicePlacement {
        self.placement
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn generate(&self, prompt: &str, bag: &ParameterBag, cancel: &CancellationToken) -> Result<GeneratedText> {
        let prompt_tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(inference_error)?
            .get_ids()
            .to_vec();

        if prompt_tokens.len() >= self.config.max_position_embeddings {
            return Err(CoreError::generation(
                "PROMPT_TOO_LONG",
                format!(
                    "Prompt has {} tokens, the model context is {}",
                    prompt_tokens.len(),
                    self.config.max_position_embeddings
                ),
                "Encoding the prompt",
                "Shorten the prompt",
            ));
        }

        let mut source = LlamaLogits::new(self)?;
        let generated = decoding::decode(&mut source, &prompt_tokens, bag, cancel)?;
        let continuation = self.decode_continuation(&prompt_tokens, &generated)?;

        let text = if bag.return_full_text {
            format!("{}{}", prompt, continuation)
        } else {
            continuation
        };

        Ok(GeneratedText {
            text,
            tokens_generated: generated.len(),
        })
    }
}

impl CandlePipeline {
    /// Decode the generated tokens in the context of the prompt so leading
    /// whitespace survives sentencepiece-style detokenization.
    fn decode_continuation(&self, prompt: &[u32], generated: &[u32]) -> Result<String> {
        let mut all = prompt.to_vec();
        all.extend_from_slice(generated);

        let full = self.tokenizer.decode(&all, true).map_err(inference_error)?;
        let prefix = self.tokenizer.decode(prompt, true).map_err(inference_error)?;

        match full.strip_prefix(prefix.as_str()) {
            Some(rest) => Ok(rest.to_string()),
            None => self.tokenizer.decode(generated, true).map_err(inference_error),
        }
    }
}

/// Forward passes with one KV cache per beam slot, reused while the slot's
/// sequence keeps extending
struct LlamaLogits<'a> {
    pipeline: &'a CandlePipeline,
    slots: Vec<Slot>,
}

#[derive(Clone)]
struct Slot {
    cache: Cache,
    history: Vec<u32>,
}

impl<'a> LlamaLogits<'a> {
    fn new(pipeline: &'a CandlePipeline) -> Result<Self> {
        Ok(Self {
            pipeline,
            slots: vec![Self::fresh_slot(pipeline)?],
        })
    }

    fn fresh_slot(pipeline: &CandlePipeline) -> Result<Slot> {
        let cache = Cache::new(true, pipeline.dtype, &pipeline.config, &pipeline.device).map_err(inference_error)?;
        Ok(Slot {
            cache,
            history: Vec::new(),
        })
    }
}

/// Number of leading positions already held in a cache built for `history`
fn cached_prefix(history: &[u32], tokens: &[u32]) -> usize {
    if !history.is_empty() && tokens.len() > history.len() && tokens.starts_with(history) {
        history.len()
    } else {
        0
    }
}

impl LogitsSource for LlamaLogits<'_> {
    fn next_logits(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        self.next_logits_for(0, tokens)
    }

    fn next_logits_for(&mut self, slot: usize, tokens: &[u32]) -> Result<Vec<f32>> {
        while self.slots.len() <= slot {
            self.slots.push(Self::fresh_slot(self.pipeline)?);
        }

        let offset = cached_prefix(&self.slots[slot].history, tokens);
        if offset == 0 && !self.slots[slot].history.is_empty() {
            self.slots[slot] = Self::fresh_slot(self.pipeline)?;
        }

        let pipeline = self.pipeline;
        let state = &mut self.slots[slot];
        let input = Tensor::new(&tokens[offset..], &pipeline.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(inference_error)?;
        let logits = pipeline
            .model
            .forward(&input, offset, &mut state.cache)
            .and_then(|l| l.squeeze(0))
            .and_then(|l| l.to_dtype(DType::F32))
            .and_then(|l| l.to_vec1::<f32>())
            .map_err(inference_error)?;

        state.history = tokens.to_vec();
        Ok(logits)
    }

    fn reorder_slots(&mut self, parents: &[usize]) {
        // cached tensors are shared until a slot appends to them
        self.slots = parents
            .iter()
            .filter_map(|&parent| self.slots.get(parent).cloned())
            .collect();
    }

    fn max_sequence_len(&self) -> Option<usize> {
        Some(self.pipeline.config.max_position_embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn hub_settings(dir: &Path) -> BackendSettings {
        BackendSettings {
            device: DevicePreference::Cpu,
            cache_dir: Some(dir.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_cached_prefix_only_for_extensions() {
        assert_eq!(cached_prefix(&[], &[1, 2]), 0);
        assert_eq!(cached_prefix(&[1, 2], &[1, 2, 3]), 2);
        assert_eq!(cached_prefix(&[1, 2], &[1, 2]), 0);
        assert_eq!(cached_prefix(&[1, 2], &[1, 4, 3]), 0);
    }

    #[test]
    fn test_check_architecture() {
        assert!(check_architecture(br#"{"model_type": "llama"}"#, "m").is_ok());
        assert!(check_architecture(br#"{"hidden_size": 8}"#, "m").is_ok());
        let err = check_architecture(br#"{"model_type": "t5"}"#, "m").unwrap_err();
        assert_eq!(err.code(), "MODEL_INCOMPATIBLE");
        assert!(check_architecture(b"{", "m").is_err());
    }

    #[test]
    fn test_shard_names_deduplicated() {
        let dir = tempdir().unwrap();
        let index = dir.path().join("model.safetensors.index.json");
        fs::write(
            &index,
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();
        assert_eq!(
            shard_names(&index).unwrap(),
            vec!["model-00001.safetensors", "model-00002.safetensors"]
        );

        fs::write(&index, r#"{"weight_map": {}}"#).unwrap();
        assert_eq!(shard_names(&index).unwrap_err().code(), "MODEL_INDEX_EMPTY");
    }

    #[test]
    fn test_directory_store_weight_files() {
        let dir = tempdir().unwrap();
        for file in ["config.json", "tokenizer.json", "model-00001.safetensors"] {
            fs::write(dir.path().join(file), "{}").unwrap();
        }
        fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"w": "model-00001.safetensors"}}"#,
        )
        .unwrap();

        let store = ArtifactStore::open(
            &ModelSource::Directory(dir.path().to_path_buf()),
            &BackendSettings::default(),
        )
        .unwrap();
        let weights = store.weight_files().unwrap();
        assert_eq!(weights, vec![dir.path().join("model-00001.safetensors")]);
    }

    #[test]
    fn test_uncached_model_without_download_fails() {
        let dir = tempdir().unwrap();
        let err = ArtifactStore::open(&ModelSource::Cached("org/absent".into()), &hub_settings(dir.path()))
            .err()
            .unwrap();
        assert_eq!(err.code(), "MODEL_NOT_CACHED");
    }

    #[test]
    fn test_cached_model_files_resolve_from_snapshot() {
        let dir = tempdir().unwrap();
        let repo_dir = dir.path().join("models--org--tiny");
        fs::create_dir_all(repo_dir.join("refs")).unwrap();
        fs::write(repo_dir.join("refs").join("main"), "abc123").unwrap();
        let snapshot = repo_dir.join("snapshots").join("abc123");
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(snapshot.join("config.json"), "{}").unwrap();

        let store = ArtifactStore::open(&ModelSource::Cached("org/tiny".into()), &hub_settings(dir.path())).unwrap();
        assert_eq!(store.fetch("config.json").unwrap(), Some(snapshot.join("config.json")));
        assert_eq!(store.fetch("tokenizer.json").unwrap(), None);
        assert_eq!(store.require("tokenizer.json").unwrap_err().code(), "MODEL_FILE_MISSING");
    }

    #[test]
    fn test_cpu_preference_selects_host() {
        let (device, placement) = select_device(&BackendSettings {
            device: DevicePreference::Cpu,
            ..Default::default()
        });
        assert!(matches!(device, Device::Cpu));
        assert_eq!(placement, DevicePlacement::Host);
    }

    #[test]
    fn test_backend_reports_missing_folder() {
        let backend = CandleBackend::new(BackendSettings::default());
        let err = backend
            .load(&ModelSource::Directory(PathBuf::from("/nonexistent/model")))
            .err()
            .unwrap();
        assert_eq!(err.code(), "MODEL_DIR_NOT_FOUND");
    }
}
