//! Custom error types for the acquisition pipeline.
//!
//! This module defines the primary error type, `AcqError`, used across the
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes of the pipeline:
//!
//! - **`Config`**: Wraps errors from the `config` crate (file parsing or
//!   format issues in the settings files).
//! - **`Io`**: Wraps standard `std::io::Error`.
//! - **`QueueClosed`**: Command dispatch failure, meaning the command queue task is
//!   gone (connection dropped). Fatal for the current capture.
//! - **`Hardware`**: A hardware command completed with a negative return
//!   code. Logged and the capture halted; the queue never retries.
//! - **`InvalidState`**: An operation was requested from a state that does
//!   not allow it (e.g. creating a buffer while one already exists).
//! - **`Parse`**: A device attribute returned a value that does not parse as
//!   a number. Non-fatal for the pipeline; the single read is dropped.
//!
//! Stale completions (a refill finishing after its buffer was invalidated)
//! are deliberately *not* errors: they are dropped silently by the buffer
//! lifecycle layer.

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command queue closed")]
    QueueClosed,

    #[error("Hardware command '{op}' failed with code {code}")]
    Hardware { op: &'static str, code: i32 },

    #[error("Invalid state for '{operation}': {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Malformed numeric attribute value: {0:?}")]
    Parse(String),

    #[error("Unknown channel index {0}")]
    UnknownChannel(usize),

    #[error("No enabled scan-element channels")]
    NoChannels,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_error_mentions_operation_and_code() {
        let err = AcqError::Hardware {
            op: "buffer_refill",
            code: -5,
        };
        let msg = err.to_string();
        assert!(msg.contains("buffer_refill"));
        assert!(msg.contains("-5"));
    }

    #[test]
    fn invalid_state_error_is_descriptive() {
        let err = AcqError::InvalidState {
            operation: "buffer_create",
            state: "Active".to_string(),
        };
        assert!(err.to_string().contains("buffer_create"));
    }
}
