//! Error types shared across rift crates

use std::fmt;

/// Result type alias using RiftError
pub type Result<T> = std::result::Result<T, RiftError>;

/// PostgreSQL SQLSTATE error codes used by the proxy.
/// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
pub mod sqlstate {
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const INVALID_CATALOG_NAME: &str = "3D000";
    pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const INTERNAL_ERROR: &str = "XX000";
}

/// Main error type for rift
#[derive(Debug, thiserror::Error)]
pub enum RiftError {
    /// Malformed wire message or unexpected message for the current state
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Wire message exceeded the 1 GiB payload cap
    #[error("message too large")]
    MessageTooLarge,

    /// The authenticate hook rejected the credentials
    #[error("authentication failed for user {0:?}")]
    AuthenticationFailed(String),

    /// Could not dial or authenticate against the upstream server
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// SQL text could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// A table reached overlay semantics without a primary key
    #[error("table {0:?} requires a primary key for overlay semantics")]
    MissingPrimaryKey(String),

    /// A referenced table does not exist upstream
    #[error("table {0:?} does not exist")]
    UnknownTable(String),

    /// Branch lookup failed
    #[error("branch {0:?} not found")]
    BranchNotFound(String),

    /// Branch already exists
    #[error("branch {0:?} already exists")]
    BranchExists(String),

    /// Branch is pinned and cannot be deleted
    #[error("branch {0:?} is pinned")]
    BranchPinned(String),

    /// Branch has children and cannot be deleted
    #[error("branch {0:?} has child branch {1:?}")]
    BranchHasChildren(String, String),

    /// Branch name failed validation
    #[error("invalid branch name: {0}")]
    InvalidBranchName(String),

    /// The main branch cannot be deleted or unpinned
    #[error("cannot modify main branch")]
    CannotModifyMain,

    /// The upstream returned an error during query execution
    #[error("{0}")]
    Executor(String),

    /// Metadata store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl RiftError {
    /// Create an internal error from any displayable error
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        RiftError::Internal(err.to_string())
    }

    /// SQLSTATE code reported to wire-protocol clients for this error
    pub fn sqlstate(&self) -> &'static str {
        match self {
            RiftError::Protocol(_) | RiftError::MessageTooLarge => sqlstate::PROTOCOL_VIOLATION,
            RiftError::AuthenticationFailed(_) => sqlstate::INSUFFICIENT_PRIVILEGE,
            RiftError::UpstreamUnavailable(_) => sqlstate::CONNECTION_FAILURE,
            RiftError::UnknownTable(_) => sqlstate::UNDEFINED_TABLE,
            RiftError::BranchNotFound(_) => sqlstate::INVALID_CATALOG_NAME,
            _ => sqlstate::INTERNAL_ERROR,
        }
    }

    /// True for errors that terminate the client connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RiftError::Protocol(_)
                | RiftError::MessageTooLarge
                | RiftError::AuthenticationFailed(_)
                | RiftError::UpstreamUnavailable(_)
                | RiftError::BranchNotFound(_)
        )
    }
}

impl From<sqlx::Error> for RiftError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => RiftError::Executor(db.message().to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                RiftError::UpstreamUnavailable(err.to_string())
            }
            other => RiftError::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for RiftError {
    fn from(err: std::io::Error) -> Self {
        RiftError::Protocol(format!("io error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(RiftError::BranchNotFound("dev".into()).sqlstate(), "3D000");
        assert_eq!(RiftError::UnknownTable("users".into()).sqlstate(), "42P01");
        assert_eq!(
            RiftError::AuthenticationFailed("bob".into()).sqlstate(),
            "42501"
        );
        assert_eq!(
            RiftError::UpstreamUnavailable("refused".into()).sqlstate(),
            "08006"
        );
        assert_eq!(RiftError::Parse("bad".into()).sqlstate(), "XX000");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RiftError::MessageTooLarge.is_fatal());
        assert!(RiftError::AuthenticationFailed("x".into()).is_fatal());
        assert!(!RiftError::Parse("x".into()).is_fatal());
        assert!(!RiftError::Executor("x".into()).is_fatal());
    }
}
