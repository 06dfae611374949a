//! Session state machine for loading, generating and filtering
//!
//! The engine is owned by the interactive task. It never blocks: submits
//! return a [`Job`] for the caller to dispatch, and worker completions come
//! back through [`InferenceEngine::apply`].

use chrono::Utc;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::TesterConfig,
    filter::{FilterOutcome, PostFilter},
    generation::{GenerationParams, GenerationRequest, GenerationResult},
    invoker::GenerationJob,
    loader::ModelLoader,
    pipeline::{DevicePlacement, ModelHandle},
    worker::{Job, WorkerEvent},
    CoreError, Result,
};

/// Outcome of a load or generate submission
#[derive(Debug)]
pub enum Submission {
    /// Work accepted; dispatch the job
    Started(Job),
    /// Work refused, tell the user why
    Rejected(Rejection),
    /// Nothing to do (blank prompt)
    Ignored,
}

/// Why a submission was refused
#[derive(Debug)]
pub enum Rejection {
    /// A generation is already running
    Busy,
    /// A load is already running
    LoadInFlight,
    /// No model has been loaded yet
    NoModel,
    /// The request failed validation
    Invalid(CoreError),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "Busy: a generation is already running"),
            Self::LoadInFlight => write!(f, "Busy: a model is still loading"),
            Self::NoModel => write!(f, "No model loaded"),
            Self::Invalid(err) => write!(f, "{}", err.summary()),
        }
    }
}

/// Model lifecycle as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    Absent,
    Loading { identifier: String },
    Ready { model_id: String, device: DevicePlacement },
    /// The last load failed; `previous` is still loaded and usable
    Failed { message: String, previous: Option<String> },
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "no model loaded"),
            Self::Loading { identifier } => write!(f, "loading {}", identifier),
            Self::Ready { model_id, device } => write!(f, "READY {} on {}", model_id, device),
            Self::Failed { message, previous } => {
                write!(f, "ERROR {}", message)?;
                if let Some(previous) = previous {
                    write!(f, " (still using {})", previous)?;
                }
                Ok(())
            }
        }
    }
}

/// What changed after applying a worker event
#[derive(Debug)]
pub enum EngineUpdate {
    ModelReady { model_id: String, device: DevicePlacement },
    ModelFailed(CoreError),
    GenerationCompleted(GenerationResult),
    GenerationFailed(CoreError),
    /// Event for a request that is no longer current
    Stale,
}

#[derive(Debug)]
enum GenerateState {
    Idle,
    Busy { request_id: u64, cancel: CancellationToken },
}

#[derive(Debug)]
struct PendingLoad {
    request_id: u64,
    identifier: String,
}

/// State owned by one interactive session
pub struct InferenceEngine {
    loader: ModelLoader,
    default_model: String,
    handle: Option<ModelHandle>,
    pending_load: Option<PendingLoad>,
    last_load_error: Option<String>,
    generate: GenerateState,
    params: GenerationParams,
    pattern: String,
    auto_filter: bool,
    response: Option<GenerationResult>,
    next_request_id: u64,
}

impl InferenceEngine {
    pub fn new(loader: ModelLoader, config: &TesterConfig) -> Self {
        Self {
            loader,
            default_model: config.model_settings.default_identifier().to_string(),
            handle: None,
            pending_load: None,
            last_load_error: None,
            generate: GenerateState::Idle,
            params: config.generation.clone(),
            pattern: config.prompt_settings.default_pattern().unwrap_or_default().to_string(),
            auto_filter: config.prompt_settings.auto_filter,
            response: None,
            next_request_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    /// Start loading `identifier`, or the configured model when `None`.
    ///
    /// Loads are refused while another load or a generation is running.
    pub fn submit_load(&mut self, identifier: Option<&str>) -> Submission {
        if self.is_busy() {
            return Submission::Rejected(Rejection::Busy);
        }
        if self.pending_load.is_some() {
            return Submission::Rejected(Rejection::LoadInFlight);
        }
        let Some(permit) = self.loader.try_begin() else {
            return Submission::Rejected(Rejection::LoadInFlight);
        };

        let identifier = identifier
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let request_id = self.next_id();
        debug!("Load request {} for {}", request_id, identifier);

        self.pending_load = Some(PendingLoad {
            request_id,
            identifier: identifier.clone(),
        });
        Submission::Started(Job::Load {
            request_id,
            identifier,
            permit,
        })
    }

    /// Start generating for `prompt` with the current parameters.
    ///
    /// A blank prompt is ignored without touching any state.
    pub fn submit_generate(&mut self, prompt: &str) -> Submission {
        let Some(request) = GenerationRequest::new(prompt, self.params.clone()) else {
            return Submission::Ignored;
        };
        if self.is_busy() {
            return Submission::Rejected(Rejection::Busy);
        }
        if self.pending_load.is_some() {
            return Submission::Rejected(Rejection::LoadInFlight);
        }
        let Some(handle) = &self.handle else {
            return Submission::Rejected(Rejection::NoModel);
        };

        let job = match GenerationJob::prepare(request, handle) {
            Ok(job) => job,
            Err(err) => return Submission::Rejected(Rejection::Invalid(err)),
        };

        let request_id = self.next_id();
        let cancel = CancellationToken::new();
        self.generate = GenerateState::Busy {
            request_id,
            cancel: cancel.clone(),
        };
        debug!("Generation request {} started", request_id);
        Submission::Started(Job::Generate {
            request_id,
            job,
            cancel,
        })
    }

    /// Apply a worker completion. Events for superseded requests are ignored.
    pub fn apply(&mut self, event: WorkerEvent) -> EngineUpdate {
        match event {
            WorkerEvent::LoadFinished { request_id, result } => {
                match &self.pending_load {
                    Some(pending) if pending.request_id == request_id => {}
                    _ => {
                        debug!("Ignoring stale load result {}", request_id);
                        return EngineUpdate::Stale;
                    }
                }
                self.pending_load = None;

                match result {
                    Ok(handle) => {
                        let update = EngineUpdate::ModelReady {
                            model_id: handle.model_id().to_string(),
                            device: handle.device(),
                        };
                        self.handle = Some(handle);
                        self.last_load_error = None;
                        update
                    }
                    Err(err) => {
                        warn!("Model load failed: {}", err.summary());
                        self.last_load_error = Some(err.summary());
                        EngineUpdate::ModelFailed(err)
                    }
                }
            }
            WorkerEvent::GenerationFinished { request_id, result } => {
                match &self.generate {
                    GenerateState::Busy { request_id: current, .. } if *current == request_id => {}
                    _ => {
                        debug!("Ignoring stale generation result {}", request_id);
                        return EngineUpdate::Stale;
                    }
                }
                self.generate = GenerateState::Idle;

                match result {
                    Ok(output) => {
                        let mut response = GenerationResult {
                            text: output.text,
                            model_id: output.model_id,
                            tokens_generated: output.tokens_generated,
                            elapsed_ms: output.elapsed_ms,
                            completed_at: Utc::now(),
                            filtered: None,
                        };
                        if self.auto_filter && !self.pattern.is_empty() {
                            response.filtered = Some(PostFilter::apply(&response.text, &self.pattern));
                        }
                        info!("Generation {} completed", request_id);
                        self.response = Some(response.clone());
                        EngineUpdate::GenerationCompleted(response)
                    }
                    Err(err) => {
                        warn!("Generation failed: {}", err.summary());
                        EngineUpdate::GenerationFailed(err)
                    }
                }
            }
        }
    }

    /// Filter the current response, optionally replacing the pattern first.
    ///
    /// Returns `None` when there is no response to filter yet.
    pub fn apply_filter(&mut self, pattern: Option<&str>) -> Option<FilterOutcome> {
        if let Some(pattern) = pattern {
            self.set_pattern(Some(pattern));
        }
        let response = self.response.as_mut()?;
        let outcome = PostFilter::apply(&response.text, &self.pattern);
        response.filtered = Some(outcome.clone());
        Some(outcome)
    }

    /// Request cancellation of the running generation
    pub fn cancel(&mut self) -> bool {
        match &self.generate {
            GenerateState::Busy { request_id, cancel } => {
                debug!("Cancelling generation {}", request_id);
                cancel.cancel();
                true
            }
            GenerateState::Idle => false,
        }
    }

    /// Update one generation parameter; used by requests submitted afterwards
    pub fn set_param(&mut self, name: &str, value: &str) -> Result<()> {
        self.params.set(name, value)
    }

    /// Set or clear (`None` or blank) the filter pattern
    pub fn set_pattern(&mut self, pattern: Option<&str>) {
        self.pattern = pattern.map(str::trim).unwrap_or_default().to_string();
    }

    pub fn model_status(&self) -> ModelStatus {
        if let Some(pending) = &self.pending_load {
            return ModelStatus::Loading {
                identifier: pending.identifier.clone(),
            };
        }
        if let Some(message) = &self.last_load_error {
            return ModelStatus::Failed {
                message: message.clone(),
                previous: self.handle.as_ref().map(|h| h.model_id().to_string()),
            };
        }
        match &self.handle {
            Some(handle) => ModelStatus::Ready {
                model_id: handle.model_id().to_string(),
                device: handle.device(),
            },
            None => ModelStatus::Absent,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.generate, GenerateState::Busy { .. })
    }

    pub fn is_loading(&self) -> bool {
        self.pending_load.is_some()
    }

    pub fn handle(&self) -> Option<&ModelHandle> {
        self.handle.as_ref()
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn response(&self) -> Option<&GenerationResult> {
        self.response.as_ref()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        generation::ParameterBag,
        pipeline::{GeneratedText, ModelBackend, ModelSource, TextGenerationPipeline},
        worker,
    };
    use std::path::PathBuf;
    use std::sync::Arc;

    struct ScriptedPipeline(String);

    impl TextGenerationPipeline for ScriptedPipeline {
        fn model_id(&self) -> &str {
            &self.0
        }
        fn device(&self) -> DevicePlacement {
            DevicePlacement::Host
        }
        fn eos_token_id(&self) -> Option<u32> {
            Some(2)
        }
        fn generate(&self, prompt: &str, _bag: &ParameterBag, _cancel: &CancellationToken) -> Result<GeneratedText> {
            if prompt.contains("fail") {
                return Err(CoreError::generation("INFERENCE_FAILED", "boom", "test", "none"));
            }
            Ok(GeneratedText {
                text: format!("{} -> range 3-9 and 10-20", prompt),
                tokens_generated: 6,
            })
        }
    }

    struct ScriptedBackend;

    impl ModelBackend for ScriptedBackend {
        fn load(&self, source: &ModelSource) -> Result<Arc<dyn TextGenerationPipeline>> {
            let name = source.display_name();
            if name.contains("missing") {
                return Err(CoreError::model_load("MODEL_NOT_CACHED", "not cached", "test", "none"));
            }
            Ok(Arc::new(ScriptedPipeline(name)))
        }
    }

    fn engine() -> InferenceEngine {
        let config = TesterConfig::from_toml(
            "[model_settings]\nname = \"org/tiny\"\n[prompt_settings]\nregex_pattern = '(\\d+)-(\\d+)'\n",
        )
        .unwrap();
        let loader = ModelLoader::new(Arc::new(ScriptedBackend), vec![], PathBuf::from("/nonexistent"));
        InferenceEngine::new(loader, &config)
    }

    fn start(submission: Submission) -> Job {
        match submission {
            Submission::Started(job) => job,
            other => panic!("not started: {:?}", other),
        }
    }

    fn run_to_completion(engine: &mut InferenceEngine, submission: Submission) -> EngineUpdate {
        let job = start(submission);
        let event = worker::run(&engine.loader().clone(), job);
        engine.apply(event)
    }

    fn loaded_engine() -> InferenceEngine {
        let mut engine = engine();
        let submission = engine.submit_load(None);
        run_to_completion(&mut engine, submission);
        engine
    }

    #[test]
    fn test_load_defaults_to_configured_model() {
        let engine = loaded_engine();
        assert_eq!(
            engine.model_status(),
            ModelStatus::Ready {
                model_id: "org/tiny".into(),
                device: DevicePlacement::Host
            }
        );
    }

    #[test]
    fn test_second_load_rejected_while_outstanding() {
        let mut engine = engine();
        let job = start(engine.submit_load(Some("org/a")));
        assert!(matches!(
            engine.submit_load(Some("org/b")),
            Submission::Rejected(Rejection::LoadInFlight)
        ));
        assert!(matches!(engine.model_status(), ModelStatus::Loading { .. }));

        let event = worker::run(&engine.loader().clone(), job);
        assert!(matches!(engine.apply(event), EngineUpdate::ModelReady { .. }));
        assert!(matches!(engine.submit_load(Some("org/b")), Submission::Started(_)));
    }

    #[test]
    fn test_failed_load_keeps_previous_handle() {
        let mut engine = loaded_engine();
        let submission = engine.submit_load(Some("org/missing"));
        let update = run_to_completion(&mut engine, submission);
        assert!(matches!(update, EngineUpdate::ModelFailed(_)));

        assert_eq!(engine.handle().unwrap().model_id(), "org/tiny");
        assert_eq!(
            engine.model_status(),
            ModelStatus::Failed {
                message: "not cached".into(),
                previous: Some("org/tiny".into())
            }
        );
        let submission = engine.submit_generate("still works");
        assert!(matches!(
            run_to_completion(&mut engine, submission),
            EngineUpdate::GenerationCompleted(_)
        ));
    }

    #[test]
    fn test_blank_prompt_is_ignored() {
        let mut engine = loaded_engine();
        assert!(matches!(engine.submit_generate("  \n "), Submission::Ignored));
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_generate_without_model_rejected() {
        let mut engine = engine();
        assert!(matches!(engine.submit_generate("hi"), Submission::Rejected(Rejection::NoModel)));
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_submissions_debug_format() {
        let mut engine = loaded_engine();
        let started = format!("{:?}", engine.submit_generate("first"));
        assert!(started.contains("Generate"), "{}", started);
        assert!(started.contains("\"first\""), "{}", started);
        assert!(started.contains("org/tiny"), "{}", started);

        let rejected = format!("{:?}", engine.submit_generate("second"));
        assert_eq!(rejected, "Rejected(Busy)");
        assert_eq!(format!("{:?}", engine.submit_generate(" ")), "Ignored");
    }

    #[test]
    fn test_busy_rejects_generate_and_load() {
        let mut engine = loaded_engine();
        let job = start(engine.submit_generate("first"));
        assert!(engine.is_busy());
        assert!(matches!(engine.submit_generate("second"), Submission::Rejected(Rejection::Busy)));
        assert!(matches!(engine.submit_load(None), Submission::Rejected(Rejection::Busy)));

        let event = worker::run(&engine.loader().clone(), job);
        engine.apply(event);
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_success_populates_response_and_auto_filters() {
        let mut engine = loaded_engine();
        let submission = engine.submit_generate("go");
        match run_to_completion(&mut engine, submission) {
            EngineUpdate::GenerationCompleted(result) => {
                assert_eq!(result.text, "go -> range 3-9 and 10-20");
                assert_eq!(result.filtered.unwrap().matches(), ["3 | 9", "10 | 20"]);
            }
            other => panic!("unexpected update {:?}", other),
        }
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_failure_leaves_response_unchanged() {
        let mut engine = loaded_engine();
        let submission = engine.submit_generate("go");
        run_to_completion(&mut engine, submission);

        let submission = engine.submit_generate("please fail");
        assert!(matches!(
            run_to_completion(&mut engine, submission),
            EngineUpdate::GenerationFailed(_)
        ));
        assert!(!engine.is_busy());
        assert_eq!(engine.response().unwrap().text, "go -> range 3-9 and 10-20");
    }

    #[test]
    fn test_stale_events_ignored() {
        let mut engine = loaded_engine();
        let event = WorkerEvent::GenerationFinished {
            request_id: 999,
            result: Err(CoreError::generation("X", "late", "test", "none")),
        };
        assert!(matches!(engine.apply(event), EngineUpdate::Stale));
    }

    #[test]
    fn test_filter_commands() {
        let mut engine = loaded_engine();
        assert!(engine.apply_filter(None).is_none());

        let submission = engine.submit_generate("go");
        run_to_completion(&mut engine, submission);

        assert_eq!(engine.apply_filter(Some("")), Some(FilterOutcome::NoPattern));
        assert_eq!(engine.apply_filter(Some("zzz")), Some(FilterOutcome::NoMatches));
        assert!(matches!(
            engine.apply_filter(Some("(")),
            Some(FilterOutcome::InvalidPattern(_))
        ));
        assert!(matches!(
            engine.response().unwrap().filtered,
            Some(FilterOutcome::InvalidPattern(_))
        ));
        assert_eq!(engine.pattern(), "(");
    }

    #[test]
    fn test_cancel_only_when_busy() {
        let mut engine = loaded_engine();
        assert!(!engine.cancel());
        let _job = start(engine.submit_generate("go"));
        assert!(engine.cancel());
    }

    #[test]
    fn test_invalid_parameter_update_rejected() {
        let mut engine = engine();
        assert!(engine.set_param("top_p", "1.5").is_err());
        engine.set_param("num_beams", "1").unwrap();
        assert_eq!(engine.params().num_beams, 1);
    }
}
