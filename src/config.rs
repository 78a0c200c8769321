//! Global configuration parsing and validation.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::models::prompt::{default_patterns, CompiledPromptPattern, PromptPattern};
use crate::{AppError, Result};

/// Isolated-runtime settings used to create fresh instances.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Container CLI binary.
    #[serde(default = "default_runtime_binary")]
    pub binary: String,
    /// Image fresh instances are created from.
    #[serde(default)]
    pub image: Option<String>,
    /// Name prefix for fresh instances; the session id is appended.
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
    /// Agent argv; `{target}`, `{module}` and `{session_id}` are substituted.
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
    /// Working directory inside the instance.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Labels applied to fresh instances.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Remove fresh instances once they exit.
    #[serde(default = "default_true")]
    pub auto_remove: bool,
}

fn default_runtime_binary() -> String {
    "docker".into()
}

fn default_instance_prefix() -> String {
    "assessment".into()
}

fn default_agent_command() -> Vec<String> {
    ["agent", "--target", "{target}", "--module", "{module}"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            image: None,
            instance_prefix: default_instance_prefix(),
            agent_command: default_agent_command(),
            workdir: None,
            labels: BTreeMap::new(),
            auto_remove: true,
        }
    }
}

/// Shared-instance reuse and network inference policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReuseConfig {
    /// Exec into a running shared instance when one is discovered.
    #[serde(default)]
    pub enabled: bool,
    /// Exact name of the shared instance.
    #[serde(default)]
    pub instance_name: Option<String>,
    /// `key=value` label identifying the shared instance.
    #[serde(default)]
    pub label: Option<String>,
    /// Infer a fresh instance's network from a sibling instance.
    #[serde(default = "default_true")]
    pub infer_network: bool,
    /// Explicit network for fresh instances; disables inference.
    #[serde(default)]
    pub network: Option<String>,
    /// Name of the sibling instance used for network inference.
    #[serde(default)]
    pub sibling_name: Option<String>,
    /// `key=value` label of the sibling instance used for network inference.
    #[serde(default)]
    pub sibling_label: Option<String>,
}

impl Default for ReuseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_name: None,
            label: None,
            infer_network: true,
            network: None,
            sibling_name: None,
            sibling_label: None,
        }
    }
}

/// Environment passed into the launched agent process.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EnvConfig {
    /// Variables forwarded verbatim.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Host variable names copied into the agent environment when set.
    #[serde(default)]
    pub forward: Vec<String>,
}

/// Automatic prompt answering.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PromptConfig {
    /// Answer known prompts automatically; off keeps manual approval.
    #[serde(default)]
    pub auto_confirm: bool,
    /// Delay before the response is written.
    #[serde(default = "default_response_delay_ms")]
    pub response_delay_ms: u64,
    /// Delay of the fallback repeat write after the first response.
    #[serde(default = "default_repeat_delay_ms")]
    pub repeat_delay_ms: u64,
    /// Whether the fallback repeat write is scheduled at all.
    #[serde(default = "default_true")]
    pub repeat: bool,
    /// Prompt patterns; replaces the built-in set when present.
    #[serde(default = "default_patterns")]
    pub patterns: Vec<PromptPattern>,
}

fn default_response_delay_ms() -> u64 {
    300
}

fn default_repeat_delay_ms() -> u64 {
    1500
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            auto_confirm: false,
            response_delay_ms: default_response_delay_ms(),
            repeat_delay_ms: default_repeat_delay_ms(),
            repeat: true,
            patterns: default_patterns(),
        }
    }
}

impl PromptConfig {
    /// Delay before the first response write.
    #[must_use]
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }

    /// Delay of the fallback repeat write, measured from the first write.
    #[must_use]
    pub fn repeat_delay(&self) -> Option<Duration> {
        self.repeat
            .then(|| Duration::from_millis(self.repeat_delay_ms))
    }
}

/// Wire-protocol framing and buffering limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Marker opening a frame.
    #[serde(default = "default_begin_sentinel")]
    pub begin_sentinel: String,
    /// Marker closing a frame.
    #[serde(default = "default_end_sentinel")]
    pub end_sentinel: String,
    /// Hard cap on the raw buffer.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    /// Tool-window accumulation that triggers a chunk flush.
    #[serde(default = "default_chunk_threshold_bytes")]
    pub chunk_threshold_bytes: usize,
    /// Earliest offset at which a flush may split on a newline.
    #[serde(default = "default_min_split_bytes")]
    pub min_split_bytes: usize,
    /// Hard cap on one tool window's accumulation.
    #[serde(default = "default_max_window_bytes")]
    pub max_window_bytes: usize,
    /// Capacity of each session's event channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Event types that mark graceful completion.
    #[serde(default = "default_completion_events")]
    pub completion_events: Vec<String>,
    /// Delay between attach and the `Ready` notification.
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,
    /// Consecutive read errors tolerated before the session is errored.
    #[serde(default = "default_max_read_errors")]
    pub max_read_errors: u32,
}

fn default_begin_sentinel() -> String {
    "<<<AGENT_EVENT>>>".into()
}

fn default_end_sentinel() -> String {
    "<<<END_AGENT_EVENT>>>".into()
}

fn default_max_buffer_bytes() -> usize {
    1_048_576
}

fn default_chunk_threshold_bytes() -> usize {
    8192
}

fn default_min_split_bytes() -> usize {
    2048
}

fn default_max_window_bytes() -> usize {
    524_288
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_completion_events() -> Vec<String> {
    vec![crate::models::event::COMPLETE_EVENT.to_owned()]
}

fn default_ready_delay_ms() -> u64 {
    250
}

fn default_max_read_errors() -> u32 {
    3
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            begin_sentinel: default_begin_sentinel(),
            end_sentinel: default_end_sentinel(),
            max_buffer_bytes: default_max_buffer_bytes(),
            chunk_threshold_bytes: default_chunk_threshold_bytes(),
            min_split_bytes: default_min_split_bytes(),
            max_window_bytes: default_max_window_bytes(),
            event_channel_capacity: default_event_channel_capacity(),
            completion_events: default_completion_events(),
            ready_delay_ms: default_ready_delay_ms(),
            max_read_errors: default_max_read_errors(),
        }
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Isolated-runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Shared-instance reuse policy.
    #[serde(default)]
    pub reuse: ReuseConfig,
    /// Agent environment.
    #[serde(default)]
    pub env: EnvConfig,
    /// Automatic prompt answering.
    #[serde(default)]
    pub prompts: PromptConfig,
    /// Framing and buffering limits.
    #[serde(default)]
    pub stream: StreamConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Environment for the agent process: forwarded host variables first,
    /// then explicit `vars`, which win on conflict.
    #[must_use]
    pub fn agent_env(&self) -> Vec<(String, String)> {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        for key in &self.env.forward {
            match env::var(key) {
                Ok(value) => {
                    merged.insert(key.clone(), value);
                }
                Err(_) => debug!(key, "forwarded variable not set on host, skipping"),
            }
        }
        merged.extend(self.env.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.into_iter().collect()
    }

    /// Validate limits, sentinels and prompt patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let stream = &self.stream;
        if stream.begin_sentinel.is_empty() || stream.end_sentinel.is_empty() {
            return Err(AppError::Config("sentinels must not be empty".into()));
        }
        if stream.begin_sentinel == stream.end_sentinel {
            return Err(AppError::Config(
                "begin_sentinel and end_sentinel must differ".into(),
            ));
        }
        if stream.max_buffer_bytes == 0 {
            return Err(AppError::Config(
                "max_buffer_bytes must be greater than zero".into(),
            ));
        }
        if stream.min_split_bytes >= stream.chunk_threshold_bytes {
            return Err(AppError::Config(
                "min_split_bytes must be smaller than chunk_threshold_bytes".into(),
            ));
        }
        if stream.chunk_threshold_bytes > stream.max_window_bytes {
            return Err(AppError::Config(
                "chunk_threshold_bytes must not exceed max_window_bytes".into(),
            ));
        }
        if stream.event_channel_capacity == 0 {
            return Err(AppError::Config(
                "event_channel_capacity must be greater than zero".into(),
            ));
        }
        if self.runtime.agent_command.is_empty() {
            return Err(AppError::Config("agent_command must not be empty".into()));
        }
        for label in [&self.reuse.label, &self.reuse.sibling_label]
            .into_iter()
            .flatten()
        {
            if !label.contains('=') {
                return Err(AppError::Config(format!(
                    "label `{label}` must have the form key=value"
                )));
            }
        }
        CompiledPromptPattern::compile_all(&self.prompts.patterns)?;
        Ok(())
    }
}
