//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::models::session::TerminalSignal;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Missing or invalid launch parameters; raised before any runtime call.
    Validation(String),
    /// A session is already running on this manager.
    AlreadyActive(String),
    /// The operation requires an active session and there is none.
    NotActive(String),
    /// Runtime unreachable, or the requested image/template does not exist.
    RuntimeUnavailable(String),
    /// Runtime call failed after the runtime was reached.
    Runtime(String),
    /// Malformed payload inside a matched frame.
    FrameParse(String),
    /// I/O fault on the attached duplex stream.
    Stream(String),
    /// Cooperative cancellation.
    Aborted(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::AlreadyActive(msg) => write!(f, "session already active: {msg}"),
            Self::NotActive(msg) => write!(f, "no active session: {msg}"),
            Self::RuntimeUnavailable(msg) => write!(f, "runtime unavailable: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime: {msg}"),
            Self::FrameParse(msg) => write!(f, "frame parse: {msg}"),
            Self::Stream(msg) => write!(f, "stream: {msg}"),
            Self::Aborted(msg) => write!(f, "aborted: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Terminal signal of a session that failed with this error. An abort
    /// is a stop, whichever phase it interrupted.
    #[must_use]
    pub fn terminal_signal(&self) -> TerminalSignal {
        match self {
            Self::Aborted(_) => TerminalSignal::Stopped,
            _ => TerminalSignal::Errored,
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::FrameParse(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
