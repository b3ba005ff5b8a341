//! Errors reported by cluster collaborators.

use thiserror::Error;

/// Result type alias for collaborator calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// A failed call against the cluster (install, tunnel, exec, fault, ...).
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("`{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        /// Exit code, or -1 when the process was killed by a signal.
        status: i32,
        stderr: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse cluster response: {0}")]
    Parse(String),

    #[error("{0}")]
    Unavailable(String),
}
