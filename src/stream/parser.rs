//! Sentinel frame parser.
//!
//! The agent writes free-form terminal output and embeds structured events as
//! `BEGIN<json>END` frames anywhere in it. Reads from the runtime split the
//! byte stream at arbitrary offsets, so [`FrameParser`] accumulates decoded
//! text and extracts every complete frame in order, handing back the raw text
//! around the frames as separate segments.
//!
//! Guarantees:
//! - A matched frame is removed from the buffer before its payload is parsed;
//!   a malformed payload yields [`Segment::Invalid`] and is never re-examined.
//! - Text that can no longer become part of a frame is released as
//!   [`Segment::Raw`] and cleared, so it is never counted twice. An
//!   unterminated frame, or a trailing prefix of the begin sentinel, stays
//!   buffered until more bytes arrive.
//! - The buffer never exceeds its cap after a feed; on overflow the oldest
//!   bytes are dropped and [`Segment::Overflow`] reports how many.
//! - Multi-byte UTF-8 sequences split across chunks are reassembled.

use crate::config::StreamConfig;
use crate::models::event::EventFrame;
use crate::AppError;

/// One ordered piece of parser output.
#[derive(Debug)]
pub enum Segment {
    /// Text outside any frame.
    Raw(String),
    /// A complete, well-formed frame.
    Frame(EventFrame),
    /// A complete frame whose payload could not be parsed, or an abandoned
    /// unterminated frame.
    Invalid(AppError),
    /// The buffer overflowed its cap and this many leading bytes were dropped.
    Overflow {
        /// Bytes discarded from the head of the buffer.
        dropped: usize,
    },
}

/// Incremental extractor of sentinel-delimited frames.
#[derive(Debug)]
pub struct FrameParser {
    begin: String,
    end: String,
    max_buffer: usize,
    buffer: String,
    utf8_carry: Vec<u8>,
}

impl FrameParser {
    /// Parser for `begin`/`end` sentinels with a `max_buffer`-byte cap.
    #[must_use]
    pub fn new(begin: impl Into<String>, end: impl Into<String>, max_buffer: usize) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
            max_buffer,
            buffer: String::new(),
            utf8_carry: Vec::new(),
        }
    }

    /// Parser configured from the `[stream]` section.
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.begin_sentinel.clone(),
            config.end_sentinel.clone(),
            config.max_buffer_bytes,
        )
    }

    /// Currently buffered text.
    #[must_use]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Wrap `payload` in this parser's sentinels.
    #[must_use]
    pub fn frame(&self, payload: &str) -> String {
        format!("{}{payload}{}", self.begin, self.end)
    }

    /// Feed one chunk: decode, sanitize, append, extract, then enforce the cap.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Segment> {
        self.push(chunk);
        let mut segments = self.extract();
        if let Some(dropped) = self.enforce_cap() {
            segments.push(Segment::Overflow { dropped });
        }
        segments
    }

    /// Flush everything at stream end. Incomplete UTF-8 becomes U+FFFD; an
    /// unterminated frame is reported as [`Segment::Invalid`]; other leftover
    /// text is released as raw.
    pub fn finish(&mut self) -> Vec<Segment> {
        if !self.utf8_carry.is_empty() {
            let tail = String::from_utf8_lossy(&std::mem::take(&mut self.utf8_carry)).into_owned();
            self.buffer.push_str(&sanitize(&tail));
        }
        let mut segments = self.extract();
        let rest = std::mem::take(&mut self.buffer);
        if let Some(begin_at) = rest.find(&self.begin) {
            if begin_at > 0 {
                segments.push(Segment::Raw(rest[..begin_at].to_owned()));
            }
            segments.push(Segment::Invalid(AppError::FrameParse(format!(
                "unterminated frame at end of stream ({} bytes)",
                rest.len() - begin_at
            ))));
        } else if !rest.is_empty() {
            segments.push(Segment::Raw(rest));
        }
        segments
    }

    /// Decode and sanitize `chunk` and append it to the buffer.
    fn push(&mut self, chunk: &[u8]) {
        let text = self.decode(chunk);
        if text.is_empty() {
            return;
        }
        self.buffer.push_str(&sanitize(&text));
    }

    /// Extract every complete frame currently in the buffer.
    fn extract(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        loop {
            let Some(begin_at) = self.buffer.find(&self.begin) else {
                self.release_unframed(&mut out);
                break;
            };
            let payload_start = begin_at + self.begin.len();
            let Some(end_rel) = self.buffer[payload_start..].find(&self.end) else {
                // Unterminated frame: only the text in front of it is final.
                if begin_at > 0 {
                    out.push(Segment::Raw(self.buffer.drain(..begin_at).collect()));
                }
                break;
            };
            let payload_end = payload_start + end_rel;

            // A second begin before the end means the first frame was cut off.
            if let Some(inner) = self.buffer[payload_start..payload_end].rfind(&self.begin) {
                let inner_at = payload_start + inner;
                let abandoned: String = self.buffer.drain(..inner_at).collect();
                if begin_at > 0 {
                    out.push(Segment::Raw(abandoned[..begin_at].to_owned()));
                }
                out.push(Segment::Invalid(AppError::FrameParse(format!(
                    "unterminated frame abandoned ({} bytes)",
                    abandoned.len() - begin_at
                ))));
                continue;
            }

            let preceding = self.buffer[..begin_at].to_owned();
            let payload = self.buffer[payload_start..payload_end].to_owned();
            // Remove before parsing so a bad payload can never be seen again.
            self.buffer.drain(..payload_end + self.end.len());

            if !preceding.is_empty() {
                out.push(Segment::Raw(preceding));
            }
            match EventFrame::from_payload(&payload) {
                Ok(frame) => out.push(Segment::Frame(frame)),
                Err(err) => out.push(Segment::Invalid(err)),
            }
        }
        out
    }

    /// Release buffered text that holds no begin sentinel, keeping only a
    /// trailing fragment that may still grow into one.
    fn release_unframed(&mut self, out: &mut Vec<Segment>) {
        let keep = self.partial_begin_suffix();
        let release = self.buffer.len() - keep;
        if release > 0 {
            out.push(Segment::Raw(self.buffer.drain(..release).collect()));
        }
    }

    /// Length of the longest buffer suffix that is a proper prefix of the
    /// begin sentinel.
    fn partial_begin_suffix(&self) -> usize {
        let longest = self.begin.len().saturating_sub(1).min(self.buffer.len());
        (1..=longest)
            .rev()
            .find(|&n| {
                let start = self.buffer.len() - n;
                self.buffer.is_char_boundary(start) && self.begin.starts_with(&self.buffer[start..])
            })
            .unwrap_or(0)
    }

    /// Truncate the buffer to its most recent half-cap tail when over the cap.
    fn enforce_cap(&mut self) -> Option<usize> {
        if self.buffer.len() <= self.max_buffer {
            return None;
        }
        let mut cut = self.buffer.len() - self.max_buffer / 2;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
        Some(cut)
    }

    /// Decode `chunk` after any carried bytes; an incomplete trailing
    /// sequence is carried into the next call.
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.utf8_carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    if let Some(invalid_len) = err.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[invalid_len..];
                    } else {
                        self.utf8_carry = after.to_vec();
                        break;
                    }
                }
            }
        }
        out
    }
}

/// Drop control characters. Tab, LF, CR and ESC survive so styled terminal
/// output keeps its escape sequences.
fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|&c| !c.is_ascii_control() || matches!(c, '\t' | '\n' | '\r' | '\x1b'))
        .collect()
}
