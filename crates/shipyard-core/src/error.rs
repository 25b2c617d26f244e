//! Error types for Shipyard.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input to a deploy or pipeline operation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation invoked in a lifecycle state that does not allow it.
    #[error("invalid state: {0}")]
    State(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The image build/push collaborator reported a failure.
    #[error("build tool error: {0}")]
    BuildTool(String),

    /// The image build/push collaborator answered with something unparseable.
    #[error("unexpected response from build tool: {0}")]
    UnexpectedResponse(String),

    /// A push finished without ever reporting a content digest.
    #[error("push of {0} completed without a repository digest")]
    MissingDigest(String),

    /// Unanticipated fault inside a work unit.
    #[error("execution fault: {0}")]
    Execution(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Faults raised by the image tooling, which build and push recover from
    /// locally instead of letting them reach the execution boundary.
    pub fn is_build_tool_fault(&self) -> bool {
        matches!(
            self,
            Error::BuildTool(_) | Error::UnexpectedResponse(_) | Error::MissingDigest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
