//! Output helpers for the MTUOC tester

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use mtuoc_core::{generation::GenerationResult, FilterOutcome};
use serde_json::Value;
use std::time::Duration;

/// Create a spinner progress bar
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠁", "⠂", "⠄", "⡀", "⢀", "⠠", "⠐", "⠈"])
        .template("{spinner:.green} {msg} [{elapsed}]")
    {
        pb.set_style(spinner_style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else if seconds > 0 {
        format!("{}.{:03}s", seconds, millis)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Print formatted output (JSON or key/value lines)
pub fn print_output(data: &Value, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string(data)?);
    } else if let Value::Object(map) = data {
        for (key, value) in map {
            println!("{}: {}", style(key).bold(), format_value(value));
        }
    } else {
        println!("{}", format_value(data));
    }
    Ok(())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        _ => value.to_string(),
    }
}

/// Print the raw response and, if present, its filter result
pub fn print_response(result: &GenerationResult, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    println!("{}", style("Response").cyan().bold());
    println!("{}", result.text);
    println!(
        "{}",
        style(format!(
            "{} tokens in {} with {}",
            result.tokens_generated,
            format_duration(Duration::from_millis(result.elapsed_ms)),
            result.model_id
        ))
        .dim()
    );
    if let Some(outcome) = &result.filtered {
        print_filter_outcome(outcome, false)?;
    }
    Ok(())
}

pub fn print_filter_outcome(outcome: &FilterOutcome, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string(outcome)?);
        return Ok(());
    }

    println!("{}", style("Filtered").cyan().bold());
    match outcome {
        FilterOutcome::InvalidPattern(_) => println!("{}", style(outcome).red()),
        FilterOutcome::Matches(_) => println!("{}", outcome),
        _ => println!("{}", style(outcome).yellow()),
    }
    Ok(())
}

/// Print error with styling
pub fn print_error(message: &str) {
    eprintln!("{} {}", style("Error:").red().bold(), message);
}

/// Print warning with styling
pub fn print_warning(message: &str) {
    eprintln!("{} {}", style("Warning:").yellow().bold(), message);
}

/// Print success message with styling
pub fn print_success(message: &str) {
    println!("{} {}", style("Success:").green().bold(), message);
}
