//! Sandbox error types.

use thiserror::Error;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors that can occur while launching or supervising a sandboxed run.
///
/// Note that a run which starts and then fails inside the sandbox (non-zero
/// exit, timeout kill, resource-limit kill) is *not* an error at this
/// boundary: it is reported through [`RunOutcome`](crate::RunOutcome) so the
/// caller can distinguish system faults from program faults.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandboxed process or container could not be launched.
    #[error("failed to launch sandbox: {0}")]
    Launch(String),

    /// Staging the execution environment (working directory, program
    /// files) failed.
    #[error("failed to stage execution environment: {0}")]
    Staging(#[source] std::io::Error),

    /// I/O failure while supervising the running sandbox.
    #[error("sandbox i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled before completion; the sandboxed process has
    /// been terminated.
    #[error("sandbox run cancelled")]
    Cancelled,
}

impl SandboxError {
    /// Returns whether this failure is worth retrying (a transient launch
    /// or supervision fault rather than a deliberate cancellation).
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            SandboxError::Launch(_) | SandboxError::Staging(_) | SandboxError::Io(_)
        )
    }
}
