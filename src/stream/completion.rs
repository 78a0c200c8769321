//! Graceful-completion detection.
//!
//! A finished assessment and a killed or crashed agent both end the same
//! stream. [`CompletionDetector`] remembers whether a completion-signaling
//! event was seen so the stream's natural end can be reported as
//! [`TerminalSignal::Complete`] or [`TerminalSignal::Stopped`].

use crate::models::event::EventKind;
use crate::models::session::TerminalSignal;

/// Per-session completion flag.
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    completion_events: Vec<String>,
    saw_completion_marker: bool,
}

impl CompletionDetector {
    /// Detector treating any of `completion_events` as the completion marker.
    #[must_use]
    pub fn new(completion_events: Vec<String>) -> Self {
        Self {
            completion_events,
            saw_completion_marker: false,
        }
    }

    /// Observe an emitted event; sets the flag on a completion marker.
    pub fn observe(&mut self, kind: &EventKind) {
        if self
            .completion_events
            .iter()
            .any(|marker| marker == kind.type_name())
        {
            self.saw_completion_marker = true;
        }
    }

    /// Whether a completion marker has been observed.
    #[must_use]
    pub fn saw_completion_marker(&self) -> bool {
        self.saw_completion_marker
    }

    /// Terminal signal for the stream's natural end.
    #[must_use]
    pub fn on_stream_end(&self) -> TerminalSignal {
        if self.saw_completion_marker {
            TerminalSignal::Complete
        } else {
            TerminalSignal::Stopped
        }
    }
}
