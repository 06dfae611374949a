//! Model discovery in the hub cache and configured model folders

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Prefix of model entries in the hub cache layout
const HUB_MODEL_PREFIX: &str = "models--";

/// Where a discovered model lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelOrigin {
    HubCache,
    LocalDirectory,
}

/// A model id found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredModel {
    /// Identifier accepted by the loader
    pub id: String,
    pub location: PathBuf,
    pub origin: ModelOrigin,
}

/// List models in `hub_cache` and in the immediate children of `model_dirs`.
///
/// Unreadable locations are logged and skipped. Results are sorted by id
/// and deduplicated.
pub fn discover(hub_cache: &Path, model_dirs: &[PathBuf]) -> Vec<DiscoveredModel> {
    let mut models = scan_hub_cache(hub_cache);
    for dir in model_dirs {
        models.extend(scan_model_dir(dir));
    }

    models.sort_by(|a, b| a.id.cmp(&b.id));
    models.dedup_by(|a, b| a.id == b.id);
    debug!("Discovered {} models", models.len());
    models
}

/// Ids to offer, falling back to the configured name when nothing was found
pub fn suggestions(models: &[DiscoveredModel], configured: &str) -> Vec<String> {
    let mut ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();
    if !ids.iter().any(|id| id == configured) {
        ids.insert(0, configured.to_string());
    }
    ids
}

/// Map a hub cache folder name such as `models--org--name` to `org/name`
pub fn hub_folder_to_id(folder: &str) -> Option<String> {
    let rest = folder.strip_prefix(HUB_MODEL_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.replace("--", "/"))
}

fn scan_hub_cache(cache: &Path) -> Vec<DiscoveredModel> {
    let entries = match std::fs::read_dir(cache) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("Model cache {} is not readable: {}", cache.display(), err);
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name();
            let id = hub_folder_to_id(name.to_str()?)?;
            Some(DiscoveredModel {
                id,
                location: entry.path(),
                origin: ModelOrigin::HubCache,
            })
        })
        .collect()
}

fn scan_model_dir(dir: &Path) -> Vec<DiscoveredModel> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("Model folder {} is not readable: {}", dir.display(), err);
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join("config.json").is_file())
        .map(|path| DiscoveredModel {
            id: path.display().to_string(),
            location: path,
            origin: ModelOrigin::LocalDirectory,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_hub_folder_to_id() {
        assert_eq!(hub_folder_to_id("models--org--name"), Some("org/name".to_string()));
        assert_eq!(hub_folder_to_id("models--gpt2"), Some("gpt2".to_string()));
        assert_eq!(hub_folder_to_id("datasets--org--name"), None);
        assert_eq!(hub_folder_to_id("models--"), None);
    }

    #[test]
    fn test_discover_cache_and_folders() {
        let cache = tempdir().unwrap();
        fs::create_dir(cache.path().join("models--org--tiny")).unwrap();
        fs::create_dir(cache.path().join("datasets--org--data")).unwrap();
        fs::write(cache.path().join("version.txt"), "1").unwrap();

        let local = tempdir().unwrap();
        let model = local.path().join("my-model");
        fs::create_dir(&model).unwrap();
        fs::write(model.join("config.json"), "{}").unwrap();
        fs::create_dir(local.path().join("not-a-model")).unwrap();

        let models = discover(cache.path(), &[local.path().to_path_buf()]);
        assert_eq!(models.len(), 2);
        assert!(models
            .iter()
            .any(|m| m.id == "org/tiny" && m.origin == ModelOrigin::HubCache));
        assert!(models
            .iter()
            .any(|m| m.location == model && m.origin == ModelOrigin::LocalDirectory));
    }

    #[test]
    fn test_unreadable_cache_yields_empty_list() {
        let models = discover(Path::new("/nonexistent/hub/cache"), &[PathBuf::from("/nonexistent/models")]);
        assert!(models.is_empty());
        assert_eq!(suggestions(&models, "org/default"), vec!["org/default"]);
    }

    #[test]
    fn test_suggestions_keep_configured_name_once() {
        let models = vec![DiscoveredModel {
            id: "org/tiny".into(),
            location: PathBuf::from("/cache/models--org--tiny"),
            origin: ModelOrigin::HubCache,
        }];
        assert_eq!(suggestions(&models, "org/tiny"), vec!["org/tiny"]);
        assert_eq!(suggestions(&models, "org/other"), vec!["org/other", "org/tiny"]);
    }
}
