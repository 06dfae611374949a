//! Model identifier resolution and single-flight loading

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    config::ModelSettings,
    discovery::{self, DiscoveredModel},
    pipeline::{BackendSettings, CandleBackend, ModelBackend, ModelHandle, ModelSource},
    CoreError, Result,
};

/// Resolves identifiers and loads them through a [`ModelBackend`].
///
/// At most one load may be outstanding; callers take a [`LoadPermit`]
/// with [`ModelLoader::try_begin`] before handing work to a worker.
#[derive(Clone)]
pub struct ModelLoader {
    backend: Arc<dyn ModelBackend>,
    model_dirs: Vec<PathBuf>,
    hub_cache: PathBuf,
    in_flight: Arc<AtomicBool>,
}

/// Proof that the caller owns the single load slot. Releases it on drop.
#[derive(Debug)]
pub struct LoadPermit {
    in_flight: Arc<AtomicBool>,
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

impl ModelLoader {
    pub fn new(backend: Arc<dyn ModelBackend>, model_dirs: Vec<PathBuf>, hub_cache: PathBuf) -> Self {
        Self {
            backend,
            model_dirs,
            hub_cache,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Loader backed by candle, configured from `[model_settings]`
    pub fn from_settings(settings: &ModelSettings) -> Self {
        let backend_settings = BackendSettings::from_model_settings(settings);
        let hub_cache = backend_settings.hub_cache().path().clone();
        let model_dirs = settings.model_dirs.iter().map(|dir| expand_path(dir)).collect();
        Self::new(Arc::new(CandleBackend::new(backend_settings)), model_dirs, hub_cache)
    }

    /// Take the load slot, or `None` if a load is already running
    pub fn try_begin(&self) -> Option<LoadPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoadPermit {
                in_flight: Arc::clone(&self.in_flight),
            })
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Decide whether `identifier` names a folder or a cached model
    pub fn resolve(&self, identifier: &str) -> Result<ModelSource> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(CoreError::model_load(
                "MODEL_ID_EMPTY",
                "No model identifier given",
                "Resolving model identifier",
                "Pass a model name or folder",
            ));
        }

        let expanded = expand_path(Path::new(identifier));
        if expanded.is_dir() {
            return Ok(ModelSource::Directory(expanded));
        }

        if looks_like_path(identifier) {
            return Err(CoreError::model_load_for(
                "MODEL_NOT_FOUND",
                format!("Model folder not found: {}", expanded.display()),
                "Resolving model identifier",
                "Check the path, or use a name from the model cache",
                identifier,
            ));
        }

        if let Some(dir) = self
            .model_dirs
            .iter()
            .map(|base| base.join(identifier))
            .find(|candidate| candidate.is_dir())
        {
            debug!("Resolved {} inside model folder {}", identifier, dir.display());
            return Ok(ModelSource::Directory(dir));
        }

        Ok(ModelSource::Cached(identifier.to_string()))
    }

    /// Resolve and load `identifier`. Blocking; run it on a worker.
    pub fn load(&self, identifier: &str) -> Result<ModelHandle> {
        let source = self.resolve(identifier)?;
        let start = Instant::now();
        info!("Loading model {}", source);

        match self.backend.load(&source) {
            Ok(pipeline) => {
                let handle = ModelHandle::new(pipeline, source);
                info!(
                    "Model {} ready on {} ({} ms)",
                    handle.model_id(),
                    handle.device(),
                    start.elapsed().as_millis()
                );
                Ok(handle)
            }
            Err(err) => {
                warn!("Loading {} failed: {}", source, err.summary());
                Err(err)
            }
        }
    }

    /// Models available locally
    pub fn discover(&self) -> Vec<DiscoveredModel> {
        discovery::discover(&self.hub_cache, &self.model_dirs)
    }

    pub fn hub_cache(&self) -> &Path {
        &self.hub_cache
    }
}

fn looks_like_path(identifier: &str) -> bool {
    identifier.starts_with('.')
        || identifier.starts_with('~')
        || Path::new(identifier).is_absolute()
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}
