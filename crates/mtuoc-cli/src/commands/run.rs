//! Interactive session
//!
//! One task owns the engine and multiplexes two inputs: lines from stdin
//! and completion events from background workers. Nothing else mutates
//! session state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use console::style;
use indicatif::ProgressBar;
use serde_json::json;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use mtuoc_core::{
    engine::{EngineUpdate, InferenceEngine, Submission},
    loader::ModelLoader,
    worker::{Dispatcher, WorkerEvent},
    TesterConfig,
};

use crate::commands::{models::print_models, Command};
use crate::input::{self, PromptBuffer, UiCommand};
use crate::utils::{
    create_spinner, print_error, print_filter_outcome, print_output, print_response, print_success, print_warning,
};

#[derive(Args, Debug, Default)]
pub struct RunCommand {
    /// Model to load at startup instead of the configured one
    #[arg(short, long)]
    pub model: Option<String>,

    /// Do not load a model at startup
    #[arg(long)]
    pub no_load: bool,
}

#[async_trait]
impl Command for RunCommand {
    async fn execute(&self, config: &TesterConfig, json_output: bool) -> Result<()> {
        debug!("Executing run command: {:?}", self);

        let loader = ModelLoader::from_settings(&config.model_settings);
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut session = Session {
            engine: InferenceEngine::new(loader.clone(), config),
            dispatcher: Dispatcher::new(loader, tx),
            spinner: None,
            json_output,
        };

        session.print_banner(&config.model_settings.name);
        if !self.no_load && (config.model_settings.load_on_startup || self.model.is_some()) {
            session.load(self.model.clone());
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut buffer = PromptBuffer::default();
        session.prompt(&buffer)?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read input")? else {
                        info!("Input closed, leaving session");
                        break;
                    };
                    if let Some(line) = buffer.push(&line) {
                        if session.handle_line(&line)? == Flow::Quit {
                            break;
                        }
                    }
                    session.prompt(&buffer)?;
                }
                Some(event) = events.recv() => {
                    session.on_event(event)?;
                    session.prompt(&buffer)?;
                }
            }
        }

        if session.engine.cancel() {
            debug!("Cancelled running generation on exit");
        }
        if session.engine.is_loading() {
            info!("Leaving while a model load is still running");
        }
        session.stop_spinner();
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct Session {
    engine: InferenceEngine,
    dispatcher: Dispatcher,
    spinner: Option<ProgressBar>,
    json_output: bool,
}

impl Session {
    fn print_banner(&self, model_name: &str) {
        if self.json_output {
            return;
        }
        println!(
            "{} {}",
            style("MTUOC tester").bold(),
            style(format!("model: {}", model_name)).dim()
        );
        println!("Type :help for commands.");
    }

    fn prompt(&self, buffer: &PromptBuffer) -> Result<()> {
        if self.json_output || self.spinner.is_some() {
            return Ok(());
        }
        print!("{} ", if buffer.is_continuing() { "..." } else { ">" });
        io::stdout().flush()?;
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> Result<Flow> {
        let command = match input::parse(line) {
            Ok(command) => command,
            Err(err) => {
                print_warning(&err.to_string());
                return Ok(Flow::Continue);
            }
        };

        match command {
            UiCommand::Generate(prompt) => {
                let submission = self.engine.submit_generate(&prompt);
                self.start(submission, "Generating...");
            }
            UiCommand::Load(identifier) => self.load(identifier),
            UiCommand::Models => {
                let models = self.engine.loader().discover();
                print_models(&models, self.engine.loader(), self.engine.default_model(), self.json_output)?;
            }
            UiCommand::Set { name, value } => match self.engine.set_param(&name, &value) {
                Ok(()) => print_success(&format!("{} = {}", name, value)),
                Err(err) => print_error(&err.summary()),
            },
            UiCommand::Params => {
                print_output(&serde_json::to_value(self.engine.params())?, self.json_output)?;
            }
            UiCommand::Pattern(pattern) => {
                self.engine.set_pattern(pattern.as_deref());
                if self.engine.pattern().is_empty() {
                    print_success("Filter pattern cleared");
                } else {
                    print_success(&format!("Filter pattern: {}", self.engine.pattern()));
                }
            }
            UiCommand::Filter(pattern) => match self.engine.apply_filter(pattern.as_deref()) {
                Some(outcome) => print_filter_outcome(&outcome, self.json_output)?,
                None => print_warning("Nothing to filter yet, generate a response first"),
            },
            UiCommand::Show => match self.engine.response() {
                Some(result) => print_response(result, self.json_output)?,
                None => print_warning("No response yet"),
            },
            UiCommand::Status => self.print_status()?,
            UiCommand::Cancel => {
                if self.engine.cancel() {
                    print_success("Cancelling generation");
                } else {
                    print_warning("Nothing to cancel");
                }
            }
            UiCommand::Help => println!("{}", input::HELP),
            UiCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn load(&mut self, identifier: Option<String>) {
        let submission = self.engine.submit_load(identifier.as_deref());
        let label = format!(
            "Loading {}...",
            identifier.as_deref().unwrap_or(self.engine.default_model())
        );
        self.start(submission, &label);
    }

    fn start(&mut self, submission: Submission, label: &str) {
        match submission {
            Submission::Started(job) => {
                debug!("Dispatching request {}", job.request_id());
                self.dispatcher.dispatch(job);
                if !self.json_output {
                    self.spinner = Some(create_spinner(label));
                }
            }
            Submission::Rejected(rejection) => print_warning(&rejection.to_string()),
            Submission::Ignored => {}
        }
    }

    fn on_event(&mut self, event: WorkerEvent) -> Result<()> {
        let update = self.engine.apply(event);
        if !matches!(update, EngineUpdate::Stale) {
            self.stop_spinner();
        }

        match update {
            EngineUpdate::ModelReady { model_id, device } => {
                if self.json_output {
                    println!("{}", json!({ "status": "ready", "model": model_id, "device": device.to_string() }));
                } else {
                    print_success(&format!("READY {} on {}", model_id, device));
                }
            }
            EngineUpdate::ModelFailed(err) => print_error(&err.to_string()),
            EngineUpdate::GenerationCompleted(result) => print_response(&result, self.json_output)?,
            EngineUpdate::GenerationFailed(err) => print_error(&err.to_string()),
            EngineUpdate::Stale => {}
        }
        Ok(())
    }

    fn print_status(&self) -> Result<()> {
        let status = json!({
            "model": self.engine.model_status().to_string(),
            "generation": if self.engine.is_busy() { "busy" } else { "idle" },
            "pattern": self.engine.pattern(),
            "response": self.engine.response().is_some(),
        });
        print_output(&status, self.json_output)
    }

    fn stop_spinner(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}
