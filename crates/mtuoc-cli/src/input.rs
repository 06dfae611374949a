//! Parsing of interactive session input

use thiserror::Error;

/// One line of session input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    /// Generate from the given prompt
    Generate(String),
    Load(Option<String>),
    Models,
    Set { name: String, value: String },
    Params,
    /// Set the filter pattern, or clear it with `None`
    Pattern(Option<String>),
    /// Filter the current response, optionally with a new pattern
    Filter(Option<String>),
    Show,
    Status,
    Cancel,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("Unknown command ':{0}' (type :help for the list)")]
    UnknownCommand(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
Type a prompt and press Enter to generate. End a line with \\ to continue
the prompt on the next line. Start a prompt with :: to send a leading colon.

  :load [id]            load a model (cache name or folder); default from config
  :models               list models found locally
  :set <param> <value>  change a generation parameter
  :params               show generation parameters
  :pattern [regex]      set the filter pattern; no argument clears it
  :filter [regex]       filter the current response
  :show                 show the last response and its filter result
  :status               show model and session state
  :cancel               stop the running generation
  :help                 show this help
  :quit                 leave the session";

/// Parse a complete logical line.
///
/// Lines starting with `:` are commands; anything else is a prompt.
pub fn parse(line: &str) -> Result<UiCommand, InputError> {
    if let Some(escaped) = line.strip_prefix("::") {
        return Ok(UiCommand::Generate(format!(":{}", escaped)));
    }
    let Some(command) = line.trim_start().strip_prefix(':') else {
        return Ok(UiCommand::Generate(line.to_string()));
    };

    let command = command.trim();
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let argument = (!rest.is_empty()).then(|| rest.to_string());

    match name {
        "load" | "l" => Ok(UiCommand::Load(argument)),
        "models" => Ok(UiCommand::Models),
        "set" => {
            let (param, value) = rest
                .split_once(char::is_whitespace)
                .ok_or(InputError::Usage(":set <param> <value>"))?;
            Ok(UiCommand::Set {
                name: param.to_string(),
                value: value.trim().to_string(),
            })
        }
        "params" => Ok(UiCommand::Params),
        "pattern" => Ok(UiCommand::Pattern(argument)),
        "filter" | "f" => Ok(UiCommand::Filter(argument)),
        "show" => Ok(UiCommand::Show),
        "status" => Ok(UiCommand::Status),
        "cancel" => Ok(UiCommand::Cancel),
        "help" | "h" | "?" => Ok(UiCommand::Help),
        "quit" | "q" | "exit" => Ok(UiCommand::Quit),
        other => Err(InputError::UnknownCommand(other.to_string())),
    }
}

/// Joins backslash-continued lines into one prompt
#[derive(Debug, Default)]
pub struct PromptBuffer {
    lines: Vec<String>,
}

impl PromptBuffer {
    /// Feed a raw line; returns the logical line once it is complete
    pub fn push(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(partial) = line.strip_suffix('\\') {
            self.lines.push(partial.to_string());
            return None;
        }
        self.lines.push(line.to_string());
        let complete = self.lines.join("\n");
        self.lines.clear();
        Some(complete)
    }

    pub fn is_continuing(&self) -> bool {
        !self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_prompt() {
        assert_eq!(
            parse("Translate: bon dia").unwrap(),
            UiCommand::Generate("Translate: bon dia".into())
        );
        assert_eq!(parse("::colon first").unwrap(), UiCommand::Generate(":colon first".into()));
    }

    #[test]
    fn test_commands() {
        assert_eq!(parse(":load").unwrap(), UiCommand::Load(None));
        assert_eq!(
            parse(":load ./models/tiny").unwrap(),
            UiCommand::Load(Some("./models/tiny".into()))
        );
        assert_eq!(
            parse(":set num_beams 2").unwrap(),
            UiCommand::Set {
                name: "num_beams".into(),
                value: "2".into()
            }
        );
        assert_eq!(parse(":pattern").unwrap(), UiCommand::Pattern(None));
        assert_eq!(
            parse(r":filter (\d+)-(\d+)").unwrap(),
            UiCommand::Filter(Some(r"(\d+)-(\d+)".into()))
        );
        assert_eq!(parse("  :quit  ").unwrap(), UiCommand::Quit);
    }

    #[test]
    fn test_bad_commands() {
        assert_eq!(parse(":set top_p").unwrap_err(), InputError::Usage(":set <param> <value>"));
        assert_eq!(parse(":bogus").unwrap_err(), InputError::UnknownCommand("bogus".into()));
    }

    #[test]
    fn test_continued_prompt() {
        let mut buffer = PromptBuffer::default();
        assert_eq!(buffer.push("first line\\"), None);
        assert!(buffer.is_continuing());
        assert_eq!(buffer.push("second line\r\n"), Some("first line\nsecond line".into()));
        assert!(!buffer.is_continuing());
    }
}
