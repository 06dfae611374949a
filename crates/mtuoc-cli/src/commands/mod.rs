//! Command implementations for the MTUOC tester

pub mod generate;
pub mod models;
pub mod run;

use anyhow::Result;
use async_trait::async_trait;
use mtuoc_core::TesterConfig;
use thiserror::Error;

/// Exit status for a command stopped with Ctrl-C
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// The user interrupted a command that cannot be cancelled cooperatively
#[derive(Debug, Error)]
#[error("Interrupted")]
pub struct Interrupted;

/// Trait for CLI command execution
#[async_trait]
pub trait Command {
    /// Execute the command
    async fn execute(&self, config: &TesterConfig, json_output: bool) -> Result<()>;
}
