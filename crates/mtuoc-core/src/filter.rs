//! Regex post-filter over the raw model response

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::{CoreError, Result};

/// Separator placed between the groups of a multi-group match
pub const GROUP_SEPARATOR: &str = " | ";

/// Outcome of applying a pattern to a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FilterOutcome {
    /// Empty pattern, nothing was filtered
    NoPattern,
    /// Pattern compiled but matched nothing
    NoMatches,
    /// Rendered matches in order of occurrence
    Matches(Vec<String>),
    /// Pattern failed to compile
    InvalidPattern(String),
}

impl FilterOutcome {
    pub fn matches(&self) -> &[String] {
        match self {
            Self::Matches(matches) => matches,
            _ => &[],
        }
    }
}

impl fmt::Display for FilterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPattern => write!(f, "No regex pattern supplied."),
            Self::NoMatches => write!(f, "No matches found."),
            Self::Matches(matches) => write!(f, "{}", matches.join("\n")),
            Self::InvalidPattern(message) => write!(f, "Regex error: {}", message),
        }
    }
}

/// Compiled post-filter
#[derive(Debug, Clone)]
pub struct PostFilter {
    regex: Regex,
}

impl PostFilter {
    /// Compile a pattern in multi-line mode
    pub fn compile(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map_err(|err| CoreError::filter_pattern("FILTER_PATTERN_INVALID", err.to_string(), pattern))?;
        Ok(Self { regex })
    }

    /// Render every match of the compiled pattern in `text`.
    ///
    /// Several capture groups are joined with [`GROUP_SEPARATOR`], a single
    /// group yields just that group and no groups yield the whole match.
    /// Groups that did not participate render as empty strings.
    pub fn find_all(&self, text: &str) -> Vec<String> {
        let groups = self.regex.captures_len() - 1;

        self.regex
            .captures_iter(text)
            .map(|caps| match groups {
                0 => caps.get(0).map(|m| m.as_str()).unwrap_or_default().to_string(),
                1 => caps.get(1).map(|m| m.as_str()).unwrap_or_default().to_string(),
                _ => (1..=groups)
                    .map(|i| caps.get(i).map(|m| m.as_str()).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join(GROUP_SEPARATOR),
            })
            .collect()
    }

    /// Apply `pattern` to `text`, never failing past this boundary
    pub fn apply(text: &str, pattern: &str) -> FilterOutcome {
        if pattern.is_empty() {
            return FilterOutcome::NoPattern;
        }

        let filter = match Self::compile(pattern) {
            Ok(filter) => filter,
            Err(err) => {
                debug!("Rejected filter pattern {:?}: {}", pattern, err.summary());
                return FilterOutcome::InvalidPattern(err.summary());
            }
        };

        let matches = filter.find_all(text);
        debug!("Pattern {:?} produced {} matches", pattern, matches.len());
        if matches.is_empty() {
            FilterOutcome::NoMatches
        } else {
            FilterOutcome::Matches(matches)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_group_matches_are_joined() {
        let outcome = PostFilter::apply("range 3-9 and 10-20", r"(\d+)-(\d+)");
        assert_eq!(
            outcome,
            FilterOutcome::Matches(vec!["3 | 9".to_string(), "10 | 20".to_string()])
        );
    }

    #[test]
    fn test_single_group_and_whole_match() {
        let outcome = PostFilter::apply("a=1 b=2", r"\w=(\d)");
        assert_eq!(outcome.matches(), ["1", "2"]);

        let outcome = PostFilter::apply("a=1 b=2", r"\w=\d");
        assert_eq!(outcome.matches(), ["a=1", "b=2"]);
    }

    #[test]
    fn test_multi_line_anchors() {
        let text = "Translation: hola\nnoise\nTranslation: adeu";
        let outcome = PostFilter::apply(text, r"^Translation: (.+)$");
        assert_eq!(outcome.matches(), ["hola", "adeu"]);
    }

    #[test]
    fn test_unmatched_optional_group_renders_empty() {
        let outcome = PostFilter::apply("x1 y", r"([a-z])(\d)?");
        assert_eq!(outcome.matches(), ["x | 1", "y | "]);
    }

    #[test]
    fn test_empty_pattern_is_distinct_from_no_matches() {
        let no_pattern = PostFilter::apply("some text", "");
        let no_matches = PostFilter::apply("some text", "zzz");
        assert_eq!(no_pattern, FilterOutcome::NoPattern);
        assert_eq!(no_matches, FilterOutcome::NoMatches);
        assert_ne!(no_pattern.to_string(), no_matches.to_string());
    }

    #[test]
    fn test_invalid_pattern_reports_error() {
        let outcome = PostFilter::apply("text", "(");
        match outcome {
            FilterOutcome::InvalidPattern(message) => assert!(!message.is_empty()),
            other => panic!("expected invalid pattern, got {:?}", other),
        }
        assert!(PostFilter::compile("(").is_err());
    }
}
