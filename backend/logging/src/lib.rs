//! Structured logging for the havoc agent.
//!
//! Console output for operators plus an optional daily-rotated JSON file.

pub mod logger;

pub use logger::{init_logger, LOG_FILE_NAME};
