//! Execution session model and lifecycle helpers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Execution topology for a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// A new isolated instance created from the configured image.
    FreshInstance,
    /// A command exec'd into an already-running shared instance.
    ExecIntoShared,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FreshInstance => f.write_str("fresh-instance"),
            Self::ExecIntoShared => f.write_str("exec-into-shared"),
        }
    }
}

/// Final lifecycle notification of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalSignal {
    /// The stream ended after the agent reported completion.
    Complete,
    /// The session was stopped, aborted, or ended without a completion marker.
    Stopped,
    /// An unrecoverable runtime failure ended the session.
    Errored,
}

impl TerminalSignal {
    /// Process exit status for a run that ended with this signal; a stopped
    /// run exits like a process interrupted by `SIGINT`.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Complete => 0,
            Self::Stopped => 130,
            Self::Errored => 1,
        }
    }
}

/// Lifecycle state of an execution session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session.
    Idle,
    /// Topology being resolved and the instance being prepared.
    Starting,
    /// Duplex stream attached; pump not yet running.
    Attached,
    /// Output is being pumped through the stream processor.
    Active,
    /// Stop requested; teardown in progress.
    Stopping,
    /// Session ended with the given signal.
    Terminated(TerminalSignal),
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Starting)
                | (Self::Starting, Self::Attached)
                | (Self::Attached, Self::Active)
                | (
                    Self::Starting | Self::Attached | Self::Active,
                    Self::Stopping | Self::Terminated(_)
                )
                | (Self::Stopping, Self::Terminated(_))
        )
    }

    /// Whether the session has reached a terminal state.
    #[must_use]
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// Parameters of one assessment launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LaunchParams {
    /// Assessment target (host, URL, or CIDR).
    pub target: String,
    /// Assessment module the agent should run.
    pub module: String,
    /// Additional parameters passed through as `AGENT_PARAM_<KEY>` variables.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl LaunchParams {
    /// Construct launch parameters with no extras.
    #[must_use]
    pub fn new(target: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            module: module.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Validate required parameters.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] when `target` or `module` is blank, or
    /// when an extra parameter key is not a valid variable-name fragment.
    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(AppError::Validation("target must not be empty".into()));
        }
        if self.module.trim().is_empty() {
            return Err(AppError::Validation("module must not be empty".into()));
        }
        if let Some(bad) = self
            .extra
            .keys()
            .find(|key| key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        {
            return Err(AppError::Validation(format!(
                "invalid parameter name `{bad}`: use letters, digits and underscores"
            )));
        }
        Ok(())
    }

    /// Environment variables describing these parameters to the agent.
    #[must_use]
    pub fn to_env(&self, session_id: &str) -> Vec<(String, String)> {
        let mut env = vec![
            ("AGENT_SESSION_ID".to_owned(), session_id.to_owned()),
            ("AGENT_TARGET".to_owned(), self.target.clone()),
            ("AGENT_MODULE".to_owned(), self.module.clone()),
        ];
        env.extend(
            self.extra
                .iter()
                .map(|(key, value)| (format!("AGENT_PARAM_{}", key.to_ascii_uppercase()), value.clone())),
        );
        env
    }
}
