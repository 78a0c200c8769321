//! Event-stream protocol engine.
//!
//! Turns the raw output of an attached agent into typed session events:
//!
//! - `reader`: pulls raw byte chunks off the attached output stream.
//! - `parser`: sentinel framing over an accumulating, capped buffer.
//! - `chunker`: bounded chunking of raw tool output inside tool windows.
//! - `prompt`: automatic answers for blocking interactive prompts.
//! - `completion`: graceful completion versus abnormal termination.
//! - `processor`: composes the above into one synchronous per-chunk pipeline.
//! - `writer`: line-oriented input channel into the agent.

pub mod chunker;
pub mod completion;
pub mod parser;
pub mod processor;
pub mod prompt;
pub mod reader;
pub mod writer;
