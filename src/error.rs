//! Error taxonomy for the broker core.
//!
//! Every fallible public operation returns `BrokerError`. Internal helpers
//! (ring buffer arithmetic, socket plumbing) are free to use `anyhow::Result`
//! the way the rest of the crate does, as long as the error is translated to
//! a `BrokerError` variant before it crosses a component boundary.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("process id already registered: {0}")]
    DuplicateId(String),

    #[error("process or transport not found: {0}")]
    NotFound(String),

    #[error("process {0} is not running")]
    NotRunning(String),

    #[error("failed to spawn process {0}: {1}")]
    SpawnError(String, #[source] std::io::Error),

    #[error("failed to establish transport for {0}: {1}")]
    ConnectError(String, String),

    #[error("I/O error on transport {0}: {1}")]
    IoError(String, #[source] std::io::Error),

    #[error("transport {0} is closed")]
    ClosedError(String),

    #[error("reconnect attempts exhausted for {0} (max {1})")]
    ReconnectExhausted(String, u32),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error("failed to decode message: {0}")]
    DecodeError(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Socket paths live under a configured directory; surface a consistent
    /// error when that directory cannot be used.
    pub fn bind_failed(path: PathBuf, source: std::io::Error) -> Self {
        BrokerError::ConnectError(path.display().to_string(), source.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
