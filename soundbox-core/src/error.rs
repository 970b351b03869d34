//! Domain-specific error types for the sound-box engine.
//!
//! All fallible operations return `Result<T, EngineError>`. The public
//! command API on a connection handler deliberately does *not* surface
//! these to callers — an unresponsive device is an ordinary outcome and
//! is reported as a boolean/optional value instead.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the device communication engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A command byte did not map to any known command code.
    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    /// A byte sequence could not be framed.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The payload exceeds what the two length bytes can describe.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Login Errors ─────────────────────────────────────────────
    /// The login handshake was rejected.
    #[error("login rejected: {0}")]
    LoginRejected(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// No live connection is registered for the requested serial number.
    #[error("device {0} is offline")]
    Offline(String),

    // ── Configuration Errors ─────────────────────────────────────
    /// The engine configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EngineError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        EngineError::ChannelClosed
    }
}
