//! Domain model module declarations.

pub mod event;
pub mod prompt;
pub mod session;
