//! Typed errors surfaced by the supervisor.
//!
//! Every failure a caller can observe is one of four categories, each with
//! a stable code and a millisecond timestamp captured at construction.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Error taxonomy for master and worker operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeepsyError {
    /// Generic failure.
    #[error("{message}")]
    Error { message: String, timestamp: u64 },

    /// An awaited response did not arrive within the deadline.
    #[error("{message}")]
    Timeout { message: String, timestamp: u64 },

    /// Spawn, send, or kill failed.
    #[error("{message}")]
    Process { message: String, timestamp: u64 },

    /// The referenced target, group, or handler does not exist.
    #[error("{message}")]
    NotFound { message: String, timestamp: u64 },
}

impl PeepsyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    /// Stable code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Error { .. } => "PEEPSY_ERROR",
            Self::Timeout { .. } => "PEEPSY_TIMEOUT",
            Self::Process { .. } => "PEEPSY_PROCESS_ERROR",
            Self::NotFound { .. } => "PEEPSY_NOT_FOUND",
        }
    }

    /// Error class name as it appears in wire payloads.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Error { .. } => "PeepsyError",
            Self::Timeout { .. } => "PeepsyTimeoutError",
            Self::Process { .. } => "PeepsyProcessError",
            Self::NotFound { .. } => "PeepsyNotFoundError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Error { message, .. }
            | Self::Timeout { message, .. }
            | Self::Process { message, .. }
            | Self::NotFound { message, .. } => message,
        }
    }

    /// Construction time, milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Error { timestamp, .. }
            | Self::Timeout { timestamp, .. }
            | Self::Process { timestamp, .. }
            | Self::NotFound { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for PeepsyError {
    fn from(e: std::io::Error) -> Self {
        Self::process(format!("IO error: {}", e))
    }
}

impl From<serde_json::Error> for PeepsyError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("Serialization error: {}", e))
    }
}
