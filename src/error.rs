/// Unified error handling for Singularity Edge
///
/// Every fallible operation in the request path, the admin surface, and
/// the store funnels into `EdgeError`. Nothing in the request path is
/// fatal to the process; only unrecoverable storage corruption at
/// startup aborts.
use std::io;
use thiserror::Error;

/// Main error type for edge operations
#[derive(Debug, Error)]
pub enum EdgeError {
    /// Backend URL could not be parsed into scheme://host:port
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// Entity with the same identity already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Pool has no healthy backends to select from
    #[error("No healthy backends available")]
    NoBackends,

    /// TCP connect to the backend failed
    #[error("Backend connect failed: {0}")]
    BackendConnect(String),

    /// TLS handshake or verification against the backend failed
    #[error("Backend TLS failure: {0}")]
    BackendTls(String),

    /// I/O error while streaming to or from the backend
    #[error("Upstream I/O error: {0}")]
    UpstreamIo(String),

    /// I/O error while streaming to or from the client
    #[error("Client I/O error: {0}")]
    ClientIo(String),

    /// Local store commit failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Peer replication fell behind or a link dropped frames
    #[error("Replication lagged: {0}")]
    ReplicationLagged(String),

    /// Admin input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for edge operations
pub type EdgeResult<T> = Result<T, EdgeError>;

impl EdgeError {
    pub fn storage<S: Into<String>>(message: S) -> Self {
        EdgeError::Storage(message.into())
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        EdgeError::Validation(message.into())
    }

    pub fn backend_connect<S: Into<String>>(message: S) -> Self {
        EdgeError::BackendConnect(message.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        EdgeError::Timeout(operation.into())
    }

    /// HTTP status the admin API and proxy error paths map this error to
    pub fn http_status(&self) -> u16 {
        match self {
            EdgeError::InvalidUrl(_) | EdgeError::Validation(_) => 422,
            EdgeError::AlreadyExists(_) => 409,
            EdgeError::NotFound(_) => 404,
            EdgeError::NoBackends => 503,
            EdgeError::BackendConnect(_) | EdgeError::BackendTls(_) => 502,
            EdgeError::Timeout(_) => 504,
            EdgeError::UpstreamIo(_)
            | EdgeError::ClientIo(_)
            | EdgeError::Storage(_)
            | EdgeError::ReplicationLagged(_) => 500,
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EdgeError::BackendConnect(_)
                | EdgeError::BackendTls(_)
                | EdgeError::UpstreamIo(_)
                | EdgeError::Timeout(_)
                | EdgeError::ReplicationLagged(_)
        )
    }
}

impl From<io::Error> for EdgeError {
    fn from(err: io::Error) -> Self {
        EdgeError::Storage(err.to_string())
    }
}
