//! Interactive prompt patterns answered automatically on the agent's behalf.

use regex::Regex;
use serde::Deserialize;

use crate::{AppError, Result};

/// What to strip from the scan buffer once a prompt matched.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemovalRule {
    /// Remove every occurrence of the matched text.
    #[default]
    Matched,
    /// Remove every line containing the matched text.
    Line,
}

/// One prompt pattern as written in the configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PromptPattern {
    /// Name reported in `PromptAnswered` events and logs.
    pub name: String,
    /// Literal text, or a regular expression when `regex` is set.
    pub pattern: String,
    /// Interpret `pattern` as a regular expression.
    #[serde(default)]
    pub regex: bool,
    /// Response template; `$1`, `${name}` expand regex capture groups.
    pub response: String,
    /// Removal rule applied after a match.
    #[serde(default)]
    pub remove: RemovalRule,
}

impl PromptPattern {
    /// Construct a literal pattern.
    #[must_use]
    pub fn literal(name: &str, pattern: &str, response: &str) -> Self {
        Self {
            name: name.to_owned(),
            pattern: pattern.to_owned(),
            regex: false,
            response: response.to_owned(),
            remove: RemovalRule::Matched,
        }
    }

    /// Construct a regex pattern.
    #[must_use]
    pub fn regex(name: &str, pattern: &str, response: &str) -> Self {
        Self {
            regex: true,
            ..Self::literal(name, pattern, response)
        }
    }
}

/// Prompts the agent's tooling is known to block on.
#[must_use]
pub fn default_patterns() -> Vec<PromptPattern> {
    vec![
        PromptPattern::regex("yes-no", r"(?i)(continue|proceed)\?\s*\[y/n\]", "y"),
        PromptPattern::regex("yes-no-default-no", r"\[y/N\]", "y"),
        PromptPattern::literal("press-enter", "Press Enter to continue", ""),
        PromptPattern::regex(
            "approve-command",
            r"(?i)approve (this )?(command|tool call)\?",
            "yes",
        ),
    ]
}

/// A [`PromptPattern`] with its matcher compiled.
#[derive(Debug, Clone)]
pub struct CompiledPromptPattern {
    /// Original pattern data.
    pub raw: PromptPattern,
    /// Compiled matcher; literal patterns are escaped.
    pub matcher: Regex,
}

impl CompiledPromptPattern {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when `pattern` is empty or is not a valid
    /// regular expression.
    pub fn compile(raw: PromptPattern) -> Result<Self> {
        if raw.pattern.is_empty() {
            return Err(AppError::Config(format!(
                "prompt pattern `{}` must not be empty",
                raw.name
            )));
        }
        let source = if raw.regex {
            raw.pattern.clone()
        } else {
            regex::escape(&raw.pattern)
        };
        let matcher = Regex::new(&source).map_err(|err| {
            AppError::Config(format!("prompt pattern `{}` is invalid: {err}", raw.name))
        })?;
        Ok(Self { raw, matcher })
    }

    /// Compile a list of patterns, failing on the first invalid one.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] for the first pattern that fails to compile.
    pub fn compile_all(patterns: &[PromptPattern]) -> Result<Vec<Self>> {
        patterns.iter().cloned().map(Self::compile).collect()
    }
}
