//! Automatic answers for blocking interactive prompts.
//!
//! Tools launched by the agent sometimes stop and wait for a keypress or a
//! `y/n` confirmation. With auto-confirm enabled, [`PromptAutomator`] scans the
//! raw (non-frame) text of the stream for configured prompt patterns and
//! produces a [`PromptResponse`] to be written into the session's input
//! channel after a short delay, plus an optional fallback repeat for agents
//! that were not yet reading when the first write landed.
//!
//! Each match is removed from the scan buffer immediately, so the same prompt
//! occurrence cannot trigger twice. A pattern that already fired stays quiet
//! until its pending writes are due, which also covers a prompt the agent
//! re-prints while the first answer is still in flight.
//!
//! With auto-confirm disabled the automator is a no-op gate and prompts are
//! left for the operator to answer manually.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PromptConfig;
use crate::models::prompt::{CompiledPromptPattern, RemovalRule};
use crate::Result;

/// Raw text retained for matching prompts split across reads.
const MAX_SCAN_BYTES: usize = 4096;

/// A response the session should write into the input channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptResponse {
    /// Name of the matched pattern.
    pub pattern: String,
    /// Text to write; a newline is appended on write.
    pub text: String,
    /// Delay before the first write.
    pub delay: Duration,
    /// Delay of the fallback repeat, measured from the first write.
    pub repeat_after: Option<Duration>,
}

/// Prompt scanner for one session.
#[derive(Debug)]
pub struct PromptAutomator {
    enabled: bool,
    patterns: Vec<CompiledPromptPattern>,
    response_delay: Duration,
    repeat_delay: Option<Duration>,
    scan_buffer: String,
    quiet_until: Vec<Option<Instant>>,
}

impl PromptAutomator {
    /// Automator over compiled `patterns`.
    #[must_use]
    pub fn new(
        patterns: Vec<CompiledPromptPattern>,
        enabled: bool,
        response_delay: Duration,
        repeat_delay: Option<Duration>,
    ) -> Self {
        let quiet_until = vec![None; patterns.len()];
        Self {
            enabled,
            patterns,
            response_delay,
            repeat_delay,
            scan_buffer: String::new(),
            quiet_until,
        }
    }

    /// Automator from the `[prompts]` section; `enabled` overrides
    /// `auto_confirm` when given.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`](crate::AppError::Config) when a pattern
    /// fails to compile.
    pub fn from_config(config: &PromptConfig, enabled: Option<bool>) -> Result<Self> {
        let patterns = CompiledPromptPattern::compile_all(&config.patterns)?;
        Ok(Self::new(
            patterns,
            enabled.unwrap_or(config.auto_confirm),
            config.response_delay(),
            config.repeat_delay(),
        ))
    }

    /// Whether the automator answers prompts at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Text retained for matching.
    #[must_use]
    pub fn scan_buffer(&self) -> &str {
        &self.scan_buffer
    }

    /// Scan newly arrived raw text. Returns a response for the first matching
    /// pattern that is not already waiting on an earlier answer.
    pub fn observe(&mut self, text: &str) -> Option<PromptResponse> {
        if !self.enabled || text.is_empty() {
            return None;
        }
        self.scan_buffer.push_str(text);
        self.trim_scan_buffer();

        let (index, response_text, matched) = self.patterns.iter().enumerate().find_map(|(i, p)| {
            p.matcher.captures(&self.scan_buffer).map(|caps| {
                let mut expanded = String::new();
                caps.expand(&p.raw.response, &mut expanded);
                (i, expanded, caps.get(0).map_or_else(String::new, |m| m.as_str().to_owned()))
            })
        })?;

        self.remove_matched(index, &matched);

        let now = Instant::now();
        let pattern = &self.patterns[index].raw.name;
        if self.quiet_until[index].is_some_and(|until| now < until) {
            debug!(pattern = %pattern, "prompt re-matched while an answer is pending, ignoring");
            return None;
        }
        self.quiet_until[index] =
            Some(now + self.response_delay + self.repeat_delay.unwrap_or_default());

        info!(pattern = %pattern, "interactive prompt detected, scheduling answer");
        Some(PromptResponse {
            pattern: pattern.clone(),
            text: response_text,
            delay: self.response_delay,
            repeat_after: self.repeat_delay,
        })
    }

    /// Forget retained text. Called at frame boundaries so a prompt can only
    /// match raw text that arrived contiguously.
    pub fn clear_scan(&mut self) {
        self.scan_buffer.clear();
    }

    fn remove_matched(&mut self, index: usize, matched: &str) {
        let pattern = &self.patterns[index];
        match pattern.raw.remove {
            RemovalRule::Matched if !matched.is_empty() => {
                self.scan_buffer = self.scan_buffer.replace(matched, "");
            }
            RemovalRule::Matched => {}
            RemovalRule::Line => {
                self.scan_buffer = self
                    .scan_buffer
                    .split_inclusive('\n')
                    .filter(|line| !pattern.matcher.is_match(line))
                    .collect();
            }
        }
    }

    fn trim_scan_buffer(&mut self) {
        if self.scan_buffer.len() <= MAX_SCAN_BYTES {
            return;
        }
        let mut cut = self.scan_buffer.len() - MAX_SCAN_BYTES;
        while !self.scan_buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.scan_buffer.drain(..cut);
    }
}
