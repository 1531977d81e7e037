//! Error types for the harness.
//!
//! The taxonomy mirrors the ways an outside-in proxy test can go wrong:
//! the socket breaks, the peer says something unexpected, something does not
//! happen in time, an external process cannot be launched, or it launches
//! and then exits unsuccessfully.
//!
//! ```
//! use prox_common::{HarnessError, HarnessResult};
//!
//! fn probe() -> HarnessResult<()> {
//!     Err(HarnessError::transport("localhost:5672", "connection refused"))
//! }
//!
//! let err = probe().unwrap_err();
//! assert!(err.is_transport());
//! ```

use crate::types::ProcessExit;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for harness operations.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Main error type for harness operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HarnessError {
    /// Socket or connection level failure (refused, reset, unexpected EOF).
    #[error("Transport error: {target} - {reason}")]
    Transport { target: String, reason: String },

    /// Malformed or unexpected peer behaviour, during handshake or steady state.
    #[error("Protocol error: {target} - {reason}")]
    Protocol { target: String, reason: String },

    /// A readiness probe or bounded wait ran out of time.
    #[error("Timeout: {target} - {operation} (after {elapsed:?})")]
    Timeout {
        target: String,
        operation: String,
        elapsed: Duration,
    },

    /// An external process could not be launched.
    #[error("Spawn failed: {executable} - {reason}")]
    Spawn { executable: String, reason: String },

    /// An external process launched but exited non-successfully.
    #[error("Workload failed: {name} - {exit}")]
    WorkloadFailure { name: String, exit: ProcessExit },

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {target} - expected {expected}, got {actual}")]
    InvalidState {
        target: String,
        expected: String,
        actual: String,
    },

    /// Invalid scenario or connection configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl HarnessError {
    pub fn transport(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(target: impl Into<String>, operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            target: target.into(),
            operation: operation.into(),
            elapsed,
        }
    }

    pub fn spawn(executable: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            executable: executable.into(),
            reason: reason.into(),
        }
    }

    pub fn workload_failure(name: impl Into<String>, exit: ProcessExit) -> Self {
        Self::WorkloadFailure {
            name: name.into(),
            exit,
        }
    }

    pub fn invalid_state(
        target: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            target: target.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Maps an I/O error raised while talking to `target` into a transport error.
    pub fn from_io(target: impl Into<String>, error: &std::io::Error) -> Self {
        Self::transport(target, format!("{} ({:?})", error, error.kind()))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_spawn(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }

    pub fn is_workload_failure(&self) -> bool {
        matches!(self, Self::WorkloadFailure { .. })
    }

    /// Short stable name of the error kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Protocol { .. } => "protocol",
            Self::Timeout { .. } => "timeout",
            Self::Spawn { .. } => "spawn",
            Self::WorkloadFailure { .. } => "workload_failure",
            Self::InvalidState { .. } => "invalid_state",
            Self::Configuration(_) => "configuration",
        }
    }
}
