//! Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Which resource ceiling a sandbox tripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Wall-clock execution time
    WallClock,
    /// Interpreter operation count
    OpCount,
    /// Memory ceiling
    Memory,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::WallClock => write!(f, "wall_clock"),
            LimitKind::OpCount => write!(f, "op_count"),
            LimitKind::Memory => write!(f, "memory"),
        }
    }
}

/// Per-step dispatch failure.
///
/// Never propagated out of the step loop: it is recorded in the action step
/// and fed back to the reasoning engine as its next observation, so the engine
/// sees its own mistake and may self-correct.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecError {
    /// Malformed action syntax or argument schema mismatch
    #[error("validation error: {0}")]
    Validation(String),

    /// Action referenced a capability absent from the registry
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    /// Code fragment referenced a disallowed module or operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Sandbox timeout, op-count or memory ceiling
    #[error("resource limit exceeded: {kind}")]
    ResourceLimitExceeded { kind: LimitKind },

    /// The invoked capability itself failed
    #[error("capability error: {0}")]
    Capability(String),

    /// Fault raised inside the sandbox while running a fragment
    #[error("sandbox fault: {0}")]
    Sandbox(String),

    /// External cancellation observed during execution
    #[error("interrupted")]
    Interrupted,
}

impl ExecError {
    /// Resource-limit errors are retried locally up to a configured count
    /// before escalating; everything else is surfaced immediately.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, ExecError::ResourceLimitExceeded { .. })
    }
}

/// Boundary-level agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Reasoning engine unreachable or not responding
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Reasoning engine returned an internal failure
    #[error("provider error: {0}")]
    Provider(String),

    /// Reasoning engine output could not be parsed into a directive
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid configuration at construction time
    #[error("configuration error: {0}")]
    Config(String),

    /// Memory log invariant violation
    #[error("memory error: {0}")]
    Memory(String),

    /// Sandbox session could not be created
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::ProviderUnavailable(_) | AgentError::Io(_)
        )
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_matrix() {
        assert!(AgentError::ProviderUnavailable("down".into()).is_retryable());
        assert!(!AgentError::Config("bad".into()).is_retryable());
        assert!(!AgentError::Parse("garbled".into()).is_retryable());
    }

    #[test]
    fn exec_error_display() {
        let err = ExecError::ResourceLimitExceeded {
            kind: LimitKind::OpCount,
        };
        assert_eq!(err.to_string(), "resource limit exceeded: op_count");
        assert!(err.is_resource_limit());
        assert!(!ExecError::Interrupted.is_resource_limit());
    }
}
