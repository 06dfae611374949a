//! MTUOC Tester - try out text-generation models from the terminal
//!
//! Load a cached or local model, send prompts, and filter the raw output
//! with a regular expression.

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use mtuoc_core::TesterConfig;

mod commands;
mod input;
mod utils;

use commands::{
    generate::GenerateCommand, models::ModelsCommand, run::RunCommand, Command, Interrupted, INTERRUPTED_EXIT_CODE,
};

/// How long background workers get once a command has returned
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(
    name = "mtuoc-tester",
    version = env!("CARGO_PKG_VERSION"),
    about = "Interactive tester for text-generation models",
    long_about = "Load a language model from the local cache or a folder, submit prompts, inspect the raw response and post-filter it with a regular expression."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "MTUOC_CONFIG")]
    config: Option<PathBuf>,

    /// JSON output format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive session (default)
    #[command(name = "run", alias = "r")]
    Run(RunCommand),

    /// Load a model, generate once and exit
    #[command(name = "generate", alias = "g")]
    Generate(GenerateCommand),

    /// List models found in the local cache and model folders
    #[command(name = "models", alias = "ls")]
    Models(ModelsCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    debug!("MTUOC tester v{} starting", env!("CARGO_PKG_VERSION"));

    // A missing or broken configuration is the only fatal startup error
    let config = match TesterConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };
    debug!("Configuration loaded: {:?}", config);

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    let result = block_on_command(runtime, async {
        match &cli.command {
            Some(Commands::Run(cmd)) => cmd.execute(&config, cli.json).await,
            Some(Commands::Generate(cmd)) => cmd.execute(&config, cli.json).await,
            Some(Commands::Models(cmd)) => cmd.execute(&config, cli.json).await,
            None => RunCommand::default().execute(&config, cli.json).await,
        }
    });

    match result {
        Ok(_) => {
            if !cli.quiet {
                info!("Command completed successfully");
            }
            Ok(())
        }
        Err(e) if e.downcast_ref::<Interrupted>().is_some() => {
            eprintln!("{}", style("Interrupted").yellow());
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Drive a command to completion.
///
/// A model load runs on a blocking thread and cannot be cancelled, so the
/// runtime is shut down with a short grace period instead of waiting for it.
fn block_on_command<F: Future>(runtime: Runtime, command: F) -> F::Output {
    let output = runtime.block_on(command);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    output
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };

    // stdout belongs to the session
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtuoc_core::{
        engine::{InferenceEngine, Submission},
        loader::ModelLoader,
        pipeline::{ModelBackend, ModelSource, TextGenerationPipeline},
        worker::Dispatcher,
        CoreError,
    };
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::mpsc;

    struct SlowBackend;

    impl ModelBackend for SlowBackend {
        fn load(&self, source: &ModelSource) -> mtuoc_core::Result<Arc<dyn TextGenerationPipeline>> {
            std::thread::sleep(Duration::from_secs(3));
            Err(CoreError::model_load("MODEL_NOT_CACHED", source.display_name(), "test", "none"))
        }
    }

    #[test]
    fn test_exit_during_load_returns_promptly() {
        let runtime = Builder::new_multi_thread().enable_all().build().unwrap();
        let started = Instant::now();

        block_on_command(runtime, async {
            let config = TesterConfig::from_toml("[model_settings]\nname = \"org/tiny\"\n").unwrap();
            let loader = ModelLoader::new(Arc::new(SlowBackend), vec![], PathBuf::from("/nonexistent"));
            let (tx, _events) = mpsc::unbounded_channel();
            let dispatcher = Dispatcher::new(loader.clone(), tx);
            let mut engine = InferenceEngine::new(loader, &config);

            match engine.submit_load(None) {
                Submission::Started(job) => {
                    dispatcher.dispatch(job);
                }
                other => panic!("not started: {:?}", other),
            }
            // give the worker time to enter the backend
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!engine.cancel());
        });

        assert!(started.elapsed() < Duration::from_secs(2), "waited {:?}", started.elapsed());
    }
}
