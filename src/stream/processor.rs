//! Per-session stream processing pipeline.
//!
//! [`StreamProcessor`] owns the parser, chunker, prompt automator and
//! completion detector of one session and turns each raw chunk into an
//! ordered list of [`ProcessorOutput`]s. Processing is synchronous: one chunk
//! is fully processed before the next is accepted, so chunks never interleave
//! mid-parse and no locking is needed.

use tracing::{trace, warn};

use crate::config::GlobalConfig;
use crate::models::event::{DiagnosticKind, EventFrame, EventKind, SessionEvent};
use crate::stream::chunker::{ChunkLimits, ClosedWindow, OutputChunk, OutputChunker};
use crate::stream::completion::CompletionDetector;
use crate::stream::parser::{FrameParser, Segment};
use crate::stream::prompt::{PromptAutomator, PromptResponse};
use crate::Result;

/// One ordered output of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutput {
    /// Event for the session's consumers.
    Event(SessionEvent),
    /// Prompt answer to schedule on the input channel.
    Respond(PromptResponse),
}

/// Stream pipeline for one session.
#[derive(Debug)]
pub struct StreamProcessor {
    parser: FrameParser,
    chunker: OutputChunker,
    automator: PromptAutomator,
    completion: CompletionDetector,
}

impl StreamProcessor {
    /// Pipeline from explicit components.
    #[must_use]
    pub fn new(
        parser: FrameParser,
        chunker: OutputChunker,
        automator: PromptAutomator,
        completion: CompletionDetector,
    ) -> Self {
        Self {
            parser,
            chunker,
            automator,
            completion,
        }
    }

    /// Pipeline from configuration; `auto_confirm` overrides the configured
    /// prompt automation switch when given.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`](crate::AppError::Config) when a prompt
    /// pattern fails to compile.
    pub fn from_config(config: &GlobalConfig, auto_confirm: Option<bool>) -> Result<Self> {
        Ok(Self::new(
            FrameParser::from_config(&config.stream),
            OutputChunker::new(ChunkLimits::from_config(&config.stream)),
            PromptAutomator::from_config(&config.prompts, auto_confirm)?,
            CompletionDetector::new(config.stream.completion_events.clone()),
        ))
    }

    /// Completion state of the session.
    #[must_use]
    pub fn completion(&self) -> &CompletionDetector {
        &self.completion
    }

    /// The underlying frame parser.
    #[must_use]
    pub fn parser(&self) -> &FrameParser {
        &self.parser
    }

    /// Process one raw chunk.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<ProcessorOutput> {
        let mut out = Vec::new();
        for segment in self.parser.feed(chunk) {
            self.handle_segment(segment, &mut out);
        }
        out
    }

    /// Flush parser leftovers and force-close any open tool window.
    pub fn finish(&mut self) -> Vec<ProcessorOutput> {
        let mut out = Vec::new();
        for segment in self.parser.finish() {
            self.handle_segment(segment, &mut out);
        }
        let closed = self.chunker.close();
        push_closed(closed, &mut out);
        out
    }

    fn handle_segment(&mut self, segment: Segment, out: &mut Vec<ProcessorOutput>) {
        match segment {
            Segment::Raw(text) => {
                trace!(bytes = text.len(), "raw text");
                if let Some(response) = self.automator.observe(&text) {
                    out.push(ProcessorOutput::Respond(response));
                }
                push_chunks(self.chunker.push(&text), out);
            }
            Segment::Frame(frame) => self.handle_frame(frame, out),
            Segment::Invalid(err) => {
                warn!(%err, "skipping malformed frame");
                out.push(ProcessorOutput::Event(SessionEvent::Diagnostic {
                    kind: DiagnosticKind::FrameParse,
                    message: err.to_string(),
                }));
            }
            Segment::Overflow { dropped } => {
                warn!(dropped, "stream buffer over capacity, oldest bytes dropped");
                out.push(ProcessorOutput::Event(SessionEvent::Diagnostic {
                    kind: DiagnosticKind::Buffer,
                    message: format!("stream buffer over capacity: dropped {dropped} bytes"),
                }));
            }
        }
    }

    fn handle_frame(&mut self, frame: EventFrame, out: &mut Vec<ProcessorOutput>) {
        self.automator.clear_scan();
        match &frame.kind {
            EventKind::ToolStart { tool_name, .. } => {
                let previous = self.chunker.open(tool_name);
                push_closed(previous, out);
            }
            EventKind::ToolOutput { tool_name, .. } => {
                self.chunker.mark_consolidated(tool_name.as_deref());
            }
            EventKind::ToolEnd { .. } | EventKind::Step { .. } => {
                let closed = self.chunker.close();
                push_closed(closed, out);
            }
            _ => {}
        }
        self.completion.observe(&frame.kind);
        out.push(ProcessorOutput::Event(SessionEvent::Frame { frame }));
    }
}

fn push_chunks(chunks: Vec<OutputChunk>, out: &mut Vec<ProcessorOutput>) {
    out.extend(chunks.into_iter().map(|chunk| {
        ProcessorOutput::Event(SessionEvent::OutputChunk {
            tool_name: chunk.tool_name,
            content: chunk.content,
            sequence: chunk.sequence,
        })
    }));
}

fn push_closed(closed: Option<ClosedWindow>, out: &mut Vec<ProcessorOutput>) {
    let Some(closed) = closed else {
        return;
    };
    if closed.dropped_bytes > 0 {
        out.push(ProcessorOutput::Event(SessionEvent::Diagnostic {
            kind: DiagnosticKind::Buffer,
            message: format!(
                "tool output over capacity: dropped {} bytes",
                closed.dropped_bytes
            ),
        }));
    }
    push_chunks(closed.chunks, out);
}
