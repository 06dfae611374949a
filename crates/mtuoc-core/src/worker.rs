//! Background workers and the messages they post back
//!
//! Loads and generations run on tokio's blocking pool. A worker never
//! touches session state: it posts exactly one [`WorkerEvent`] on the
//! session's channel when it finishes, panics included.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    invoker::{GenerationJob, GenerationOutput},
    loader::{LoadPermit, ModelLoader},
    pipeline::ModelHandle,
    CoreError, Result,
};

/// Work handed to a background thread
#[derive(Debug)]
pub enum Job {
    Load {
        request_id: u64,
        identifier: String,
        permit: LoadPermit,
    },
    Generate {
        request_id: u64,
        job: GenerationJob,
        cancel: CancellationToken,
    },
}

impl Job {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Load { request_id, .. } | Self::Generate { request_id, .. } => *request_id,
        }
    }
}

/// Completion message posted by a worker
#[derive(Debug)]
pub enum WorkerEvent {
    LoadFinished {
        request_id: u64,
        result: Result<ModelHandle>,
    },
    GenerationFinished {
        request_id: u64,
        result: Result<GenerationOutput>,
    },
}

/// Spawns jobs on the blocking pool and routes their events to the session
#[derive(Clone)]
pub struct Dispatcher {
    loader: ModelLoader,
    events: UnboundedSender<WorkerEvent>,
}

impl Dispatcher {
    pub fn new(loader: ModelLoader, events: UnboundedSender<WorkerEvent>) -> Self {
        Self { loader, events }
    }

    pub fn dispatch(&self, job: Job) -> JoinHandle<()> {
        let loader = self.loader.clone();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let event = run(&loader, job);
            if events.send(event).is_err() {
                debug!("Session closed before the worker finished");
            }
        })
    }
}

/// Run a job to completion on the current thread
pub fn run(loader: &ModelLoader, job: Job) -> WorkerEvent {
    match job {
        Job::Load {
            request_id,
            identifier,
            permit,
        } => {
            let result = catch_unwind(AssertUnwindSafe(|| loader.load(&identifier))).unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!("Model load panicked: {}", message);
                Err(CoreError::model_load_for(
                    "MODEL_LOAD_PANICKED",
                    format!("Model loading crashed: {}", message),
                    "Loading model on a worker thread",
                    "Check the model files; this is likely a bug in the backend",
                    identifier.as_str(),
                ))
            });
            // release the slot before the session hears about it
            drop(permit);
            WorkerEvent::LoadFinished { request_id, result }
        }
        Job::Generate {
            request_id,
            job,
            cancel,
        } => {
            let result = catch_unwind(AssertUnwindSafe(|| job.execute(&cancel))).unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!("Generation panicked: {}", message);
                Err(CoreError::generation(
                    "GENERATION_PANICKED",
                    format!("Generation crashed: {}", message),
                    "Running generation on a worker thread",
                    "Try different parameters or reload the model",
                ))
            });
            WorkerEvent::GenerationFinished { request_id, result }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
