//! Container error types.
//!
//! Display strings are part of the public contract: embedders match on
//! them, and the scenario tests pin them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors surfaced to the embedder by host-side operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    /// The container was disposed (or never finished initializing).
    #[error("disposed")]
    Disposed,

    /// The channel was torn down while a request was pending.
    #[error("worker disposed")]
    WorkerDisposed,

    /// The hard process-count ceiling was hit.
    #[error("Maximum process limit ({limit}) reached")]
    MaxProcesses { limit: usize },

    /// A correlated request exceeded its budget.
    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    /// The worker replied with a variant the requester did not expect.
    #[error("invalid worker response")]
    UnexpectedReply,

    /// The worker rejected the request; message surfaced verbatim.
    #[error("{0}")]
    Worker(String),

    /// The worker could not start a process for this command.
    #[error("failed to spawn: {0}")]
    SpawnFailed(String),
}

impl ContainerError {
    /// Wrap a worker-side error string, preserving spawn context.
    pub fn from_worker(message: impl Into<String>) -> Self {
        ContainerError::Worker(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_are_stable() {
        assert_eq!(ContainerError::Disposed.to_string(), "disposed");
        assert_eq!(ContainerError::WorkerDisposed.to_string(), "worker disposed");
        assert_eq!(
            ContainerError::MaxProcesses { limit: 2 }.to_string(),
            "Maximum process limit (2) reached"
        );
        assert_eq!(
            ContainerError::Timeout { ms: 50 }.to_string(),
            "Request timeout after 50ms"
        );
        assert_eq!(
            ContainerError::SpawnFailed("no executor".into()).to_string(),
            "failed to spawn: no executor"
        );
    }
}
