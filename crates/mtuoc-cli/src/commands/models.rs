//! List locally available models

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use console::style;
use serde_json::json;
use tabled::{settings::Style, Table, Tabled};
use tracing::debug;

use mtuoc_core::{
    discovery::{self, DiscoveredModel, ModelOrigin},
    loader::ModelLoader,
    TesterConfig,
};

use crate::commands::Command;

#[derive(Args, Debug, Default)]
pub struct ModelsCommand {}

#[derive(Tabled)]
struct ModelRow {
    id: String,
    origin: String,
    location: String,
}

#[async_trait]
impl Command for ModelsCommand {
    async fn execute(&self, config: &TesterConfig, json_output: bool) -> Result<()> {
        debug!("Executing models command");
        let loader = ModelLoader::from_settings(&config.model_settings);
        let models = loader.discover();
        print_models(&models, &loader, config.model_settings.default_identifier(), json_output)
    }
}

/// Render discovered models, marking the configured default
pub fn print_models(
    models: &[DiscoveredModel],
    loader: &ModelLoader,
    configured: &str,
    json_output: bool,
) -> Result<()> {
    if json_output {
        let output = json!({
            "configured": configured,
            "cache": loader.hub_cache().display().to_string(),
            "models": models,
            "suggestions": discovery::suggestions(models, configured),
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if models.is_empty() {
        println!(
            "No models found in {}",
            style(loader.hub_cache().display()).dim()
        );
    } else {
        let rows = models.iter().map(|model| ModelRow {
            id: if model.id == configured {
                format!("{} *", model.id)
            } else {
                model.id.clone()
            },
            origin: match model.origin {
                ModelOrigin::HubCache => "cache".to_string(),
                ModelOrigin::LocalDirectory => "folder".to_string(),
            },
            location: model.location.display().to_string(),
        });
        println!("{}", Table::new(rows).with(Style::modern()));
    }
    println!("Configured model: {}", style(configured).bold());
    Ok(())
}
