//! Tool-window output chunking.
//!
//! Between a `tool_start` and its closing event the agent's raw terminal
//! output belongs to the running tool. [`OutputChunker`] accumulates that text
//! and emits it as bounded [`OutputChunk`]s: whenever the window holds more
//! than the chunk threshold, and once more when the window closes.
//!
//! Chunks split after the last newline at or beyond `min_split` inside the
//! threshold, falling back to a hard split at the threshold. When the agent
//! reports the tool's output itself (`tool_output`), the closing flush is
//! suppressed so the output is not shown twice.

use tracing::{debug, warn};

use crate::config::StreamConfig;

/// Chunking limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Accumulation above which a chunk is flushed.
    pub threshold: usize,
    /// Earliest offset at which a flush may split on a newline.
    pub min_split: usize,
    /// Hard cap on one window's accumulation; oldest bytes are dropped beyond it.
    pub max_window: usize,
}

impl ChunkLimits {
    /// Limits from the `[stream]` section.
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            threshold: config.chunk_threshold_bytes,
            min_split: config.min_split_bytes,
            max_window: config.max_window_bytes,
        }
    }
}

/// One emitted slice of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Tool the window belongs to.
    pub tool_name: String,
    /// Chunk text.
    pub content: String,
    /// Per-window ordinal, starting at zero.
    pub sequence: u64,
}

/// Result of closing a window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosedWindow {
    /// Final chunks (empty when suppressed).
    pub chunks: Vec<OutputChunk>,
    /// Bytes dropped over the window's lifetime because of the cap.
    pub dropped_bytes: usize,
    /// Whether the closing flush was suppressed by consolidated output.
    pub suppressed: bool,
}

#[derive(Debug)]
struct ToolWindow {
    tool_name: String,
    buffer: String,
    saw_consolidated_output: bool,
    next_sequence: u64,
    dropped_bytes: usize,
}

impl ToolWindow {
    fn chunk(&mut self, content: String) -> OutputChunk {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        OutputChunk {
            tool_name: self.tool_name.clone(),
            content,
            sequence,
        }
    }
}

/// Accumulator for the currently open tool window.
#[derive(Debug)]
pub struct OutputChunker {
    limits: ChunkLimits,
    window: Option<ToolWindow>,
}

impl OutputChunker {
    /// Chunker with no open window.
    #[must_use]
    pub fn new(limits: ChunkLimits) -> Self {
        Self {
            limits,
            window: None,
        }
    }

    /// Whether a tool window is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.window.is_some()
    }

    /// Tool name of the open window.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.window.as_ref().map(|w| w.tool_name.as_str())
    }

    /// Open a window for `tool_name`, closing any window still open.
    pub fn open(&mut self, tool_name: &str) -> Option<ClosedWindow> {
        let previous = self.close();
        debug!(tool_name, "tool window opened");
        self.window = Some(ToolWindow {
            tool_name: tool_name.to_owned(),
            buffer: String::new(),
            saw_consolidated_output: false,
            next_sequence: 0,
            dropped_bytes: 0,
        });
        previous
    }

    /// Record that the agent reported consolidated output for the open window.
    /// A `tool_name` naming a different tool is ignored.
    pub fn mark_consolidated(&mut self, tool_name: Option<&str>) {
        if let Some(window) = self.window.as_mut() {
            if tool_name.map_or(true, |name| name == window.tool_name) {
                window.saw_consolidated_output = true;
            }
        }
    }

    /// Append raw text to the open window and flush full chunks. Text arriving
    /// with no window open is ignored.
    pub fn push(&mut self, text: &str) -> Vec<OutputChunk> {
        let limits = self.limits;
        let Some(window) = self.window.as_mut() else {
            return Vec::new();
        };
        window.buffer.push_str(text);

        if window.buffer.len() > limits.max_window {
            let mut cut = window.buffer.len() - limits.max_window;
            while !window.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            window.buffer.drain(..cut);
            window.dropped_bytes += cut;
            warn!(
                tool_name = %window.tool_name,
                dropped = cut,
                "tool window over capacity, oldest output dropped"
            );
        }

        let mut chunks = Vec::new();
        while window.buffer.len() > limits.threshold {
            let split = split_point(&window.buffer, limits);
            let content: String = window.buffer.drain(..split).collect();
            chunks.push(window.chunk(content));
        }
        chunks
    }

    /// Close the open window, force-flushing what remains unless consolidated
    /// output was observed.
    pub fn close(&mut self) -> Option<ClosedWindow> {
        let mut window = self.window.take()?;
        let remaining = std::mem::take(&mut window.buffer);
        let mut closed = ClosedWindow {
            dropped_bytes: window.dropped_bytes,
            suppressed: window.saw_consolidated_output,
            chunks: Vec::new(),
        };
        if window.saw_consolidated_output {
            debug!(
                tool_name = %window.tool_name,
                suppressed = remaining.len(),
                "closing flush suppressed by consolidated output"
            );
        } else if !remaining.is_empty() {
            closed.chunks.push(window.chunk(remaining));
        }
        debug!(tool_name = %window.tool_name, "tool window closed");
        Some(closed)
    }
}

/// Offset at which to split `buffer` (longer than the threshold): just past
/// the last newline in `[min_split, threshold)`, else at the threshold.
fn split_point(buffer: &str, limits: ChunkLimits) -> usize {
    let mut limit = limits.threshold.min(buffer.len());
    while limit > 0 && !buffer.is_char_boundary(limit) {
        limit -= 1;
    }
    if limit == 0 {
        // Threshold smaller than the first character: take that character.
        return buffer.chars().next().map_or(buffer.len(), char::len_utf8);
    }
    buffer[..limit]
        .rfind('\n')
        .filter(|&at| at >= limits.min_split)
        .map_or(limit, |at| at + 1)
}
