//! Structured events carried inside sentinel frames, and the session-level
//! events emitted to consumers.
//!
//! A frame payload is a JSON object with a required `type` discriminator.
//! Known discriminators map onto [`EventKind`] variants with their required
//! fields; anything the variant does not consume is preserved verbatim in
//! [`EventFrame::attributes`] so newer agents can add fields without breaking
//! older clients.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::session::TerminalSignal;
use crate::{AppError, Result};

/// Wire discriminator of the default completion-signaling event.
pub const COMPLETE_EVENT: &str = "complete";

/// Typed view of a frame's `type` discriminator and its required fields.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Free-form agent message.
    Message {
        /// Message body.
        content: String,
    },
    /// Agent reasoning summary.
    Thinking {
        /// Reasoning text.
        content: String,
    },
    /// A tool invocation started; opens a tool window.
    ToolStart {
        /// Name of the invoked tool.
        tool_name: String,
        /// Invocation arguments, if reported.
        args: Option<Value>,
    },
    /// Consolidated output reported by the agent itself for a tool call.
    ToolOutput {
        /// Tool the output belongs to, when reported.
        tool_name: Option<String>,
        /// Complete tool output.
        output: String,
    },
    /// A tool invocation finished; closes the tool window.
    ToolEnd {
        /// Tool that finished, when reported.
        tool_name: Option<String>,
        /// Completion status (`ok`, `error`, ...), when reported.
        status: Option<String>,
    },
    /// Agent step boundary; closes any open tool window.
    Step {
        /// Step ordinal, when reported.
        index: Option<u64>,
    },
    /// Security finding reported by the agent.
    Finding {
        /// Short finding title.
        title: String,
        /// Severity label.
        severity: Option<String>,
        /// Longer description.
        details: Option<String>,
    },
    /// Progress or status line.
    Status {
        /// Status text.
        message: String,
    },
    /// Error reported by the agent (not a protocol error).
    Error {
        /// Error text.
        message: String,
    },
    /// The agent finished its assessment.
    Complete {
        /// Final summary, when reported.
        summary: Option<String>,
    },
    /// Discriminator this client does not know; all fields stay in attributes.
    Other {
        /// Raw discriminator value.
        kind: String,
    },
}

impl EventKind {
    /// Wire discriminator for this kind.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Message { .. } => "message",
            Self::Thinking { .. } => "thinking",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolOutput { .. } => "tool_output",
            Self::ToolEnd { .. } => "tool_end",
            Self::Step { .. } => "step",
            Self::Finding { .. } => "finding",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Complete { .. } => COMPLETE_EVENT,
            Self::Other { kind } => kind.as_str(),
        }
    }
}

/// One parsed frame. Created per parse, forwarded to consumers, never retained.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    /// Typed discriminator and required fields.
    pub kind: EventKind,
    /// Timestamp reported by the agent, or receipt time when absent.
    pub timestamp: DateTime<Utc>,
    /// Correlation identifier reported by the agent, or a generated UUID.
    pub correlation_id: String,
    /// Every payload field not consumed by `kind`.
    pub attributes: Map<String, Value>,
}

impl EventFrame {
    /// Parse a frame payload (the text between the sentinels).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::FrameParse`] when the payload is not a JSON object,
    /// lacks a string `type`, or lacks a field required by its type.
    pub fn from_payload(payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload.trim())?;
        let Value::Object(mut map) = value else {
            return Err(AppError::FrameParse("payload is not a JSON object".into()));
        };

        let kind_name = match map.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(_) => return Err(AppError::FrameParse("`type` must be a string".into())),
            None => return Err(AppError::FrameParse("missing required field: `type`".into())),
        };

        let timestamp = take_timestamp(&mut map);
        let correlation_id = take_optional_string(&mut map, "correlation_id")
            .or_else(|| take_optional_string(&mut map, "id"))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let kind = parse_kind(&kind_name, &mut map)?;

        Ok(Self {
            kind,
            timestamp,
            correlation_id,
            attributes: map,
        })
    }

    /// Re-assemble the wire representation: discriminator, lifted fields and
    /// the attribute bag.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = self.attributes.clone();
        map.insert("type".into(), Value::String(self.kind.type_name().to_owned()));
        map.insert("timestamp".into(), Value::String(self.timestamp.to_rfc3339()));
        map.insert("id".into(), Value::String(self.correlation_id.clone()));

        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                map.insert(key.to_owned(), value);
            }
        };
        match &self.kind {
            EventKind::Message { content } | EventKind::Thinking { content } => {
                put("content", Some(Value::String(content.clone())));
            }
            EventKind::ToolStart { tool_name, args } => {
                put("tool_name", Some(Value::String(tool_name.clone())));
                put("args", args.clone());
            }
            EventKind::ToolOutput { tool_name, output } => {
                put("tool_name", tool_name.clone().map(Value::String));
                put("output", Some(Value::String(output.clone())));
            }
            EventKind::ToolEnd { tool_name, status } => {
                put("tool_name", tool_name.clone().map(Value::String));
                put("status", status.clone().map(Value::String));
            }
            EventKind::Step { index } => put("index", index.map(Value::from)),
            EventKind::Finding {
                title,
                severity,
                details,
            } => {
                put("title", Some(Value::String(title.clone())));
                put("severity", severity.clone().map(Value::String));
                put("details", details.clone().map(Value::String));
            }
            EventKind::Status { message } | EventKind::Error { message } => {
                put("message", Some(Value::String(message.clone())));
            }
            EventKind::Complete { summary } => put("summary", summary.clone().map(Value::String)),
            EventKind::Other { .. } => {}
        }
        Value::Object(map)
    }
}

impl Serialize for EventFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Lifecycle notification stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum LifecycleStage {
    /// Startup progress narration.
    Starting {
        /// Human-readable description of the current startup step.
        detail: String,
    },
    /// The session is attached and the agent is expected to be reading input.
    Ready,
    /// A non-terminal error worth surfacing to the operator.
    Error {
        /// Error description.
        message: String,
    },
}

/// Category of a locally recovered fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Malformed payload inside a matched frame.
    FrameParse,
    /// Read fault on the attached stream.
    Stream,
    /// Buffer or tool-window overflow; oldest bytes were dropped.
    Buffer,
}

/// Events delivered to consumers over a session's event channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Lifecycle notification.
    Lifecycle {
        /// Session the notification belongs to.
        session_id: String,
        /// Lifecycle stage.
        #[serde(flatten)]
        stage: LifecycleStage,
    },
    /// Parsed structured event.
    Frame {
        /// Parsed frame.
        frame: EventFrame,
    },
    /// Slice of raw tool output captured inside a tool window.
    OutputChunk {
        /// Tool whose window produced the chunk.
        tool_name: String,
        /// Chunk text.
        content: String,
        /// Per-window chunk ordinal, starting at zero.
        sequence: u64,
    },
    /// Locally recovered fault; streaming continues.
    Diagnostic {
        /// Fault category.
        kind: DiagnosticKind,
        /// Fault description.
        message: String,
    },
    /// An interactive prompt was answered automatically.
    PromptAnswered {
        /// Name of the matched prompt pattern.
        pattern: String,
        /// Response written to the input channel.
        response: String,
    },
    /// Final notification for the session; emitted exactly once.
    Terminated {
        /// Terminal signal.
        signal: TerminalSignal,
        /// Human-readable reason.
        reason: String,
    },
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn parse_kind(kind: &str, map: &mut Map<String, Value>) -> Result<EventKind> {
    let parsed = match kind {
        "message" => EventKind::Message {
            content: take_required_string(map, kind, "content")?,
        },
        "thinking" => EventKind::Thinking {
            content: take_required_string(map, kind, "content")?,
        },
        "tool_start" => EventKind::ToolStart {
            tool_name: take_required_string(map, kind, "tool_name")?,
            args: map.remove("args"),
        },
        "tool_output" => EventKind::ToolOutput {
            output: take_required_string(map, kind, "output")?,
            tool_name: take_optional_string(map, "tool_name"),
        },
        "tool_end" => EventKind::ToolEnd {
            tool_name: take_optional_string(map, "tool_name"),
            status: take_optional_string(map, "status"),
        },
        "step" => EventKind::Step {
            index: match map.get("index").and_then(Value::as_u64) {
                Some(index) => {
                    map.remove("index");
                    Some(index)
                }
                None => None,
            },
        },
        "finding" => EventKind::Finding {
            title: take_required_string(map, kind, "title")?,
            severity: take_optional_string(map, "severity"),
            details: take_optional_string(map, "details"),
        },
        "status" => EventKind::Status {
            message: take_required_string(map, kind, "message")?,
        },
        "error" => EventKind::Error {
            message: take_required_string(map, kind, "message")?,
        },
        COMPLETE_EVENT => EventKind::Complete {
            summary: take_optional_string(map, "summary"),
        },
        other => EventKind::Other {
            kind: other.to_owned(),
        },
    };
    Ok(parsed)
}

fn take_required_string(map: &mut Map<String, Value>, kind: &str, key: &str) -> Result<String> {
    match map.remove(key) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => {
            map.insert(key.to_owned(), other);
            Err(AppError::FrameParse(format!(
                "field `{key}` of `{kind}` must be a string"
            )))
        }
        None => Err(AppError::FrameParse(format!(
            "missing required field: `{key}` in `{kind}`"
        ))),
    }
}

/// Remove `key` when it holds a string; non-string values stay in the bag.
fn take_optional_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    if !matches!(map.get(key), Some(Value::String(_))) {
        return None;
    }
    match map.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

/// Lift `timestamp` (RFC 3339 or epoch millis). Unparseable values stay in the
/// attribute bag and receipt time is used instead.
fn take_timestamp(map: &mut Map<String, Value>) -> DateTime<Utc> {
    let parsed = match map.get("timestamp") {
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Some(Value::Number(millis)) => millis.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    };
    match parsed {
        Some(ts) => {
            map.remove("timestamp");
            ts
        }
        None => Utc::now(),
    }
}
