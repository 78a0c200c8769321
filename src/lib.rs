#![forbid(unsafe_code)]

//! Launches a security-assessment agent in an isolated runtime instance and
//! turns its output stream into typed session events.

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod runtime;
pub mod stream;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
