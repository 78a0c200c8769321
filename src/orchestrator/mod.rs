//! Session orchestration modules.
//!
//! Covers the single-session lifecycle (topology, attach, pump, stop) and the
//! per-session scheduler of delayed actions.

pub mod scheduler;
pub mod session_manager;
