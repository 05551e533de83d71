//! Custom error types for the application.
//!
//! `TriggerError` consolidates the failure modes of the capture tool. Setup
//! failures (configuration, transport attach, header exchange) abort before
//! steady state; a [`TriggerError::ShortWrite`] is the one fatal steady-state
//! condition. Everything else is absorbed locally and logged.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, TriggerError>;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Header exchange failed: {0}")]
    Header(String),

    #[error("Short write to output stream: wrote {written} of {expected} bytes")]
    ShortWrite { written: u64, expected: u64 },

    #[error("Control channel error: {0}")]
    Control(String),

    #[error("Failed to bind to CPU core {0}")]
    Affinity(usize),
}
