//! Unified error handling for the client.

use crate::config::ConfigError;
use std::fmt;

/// Domain tag for errors raised by this crate itself.
pub const ERROR_DOMAIN: &str = "harbor";

/// Why a conflict could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictCause {
    /// The conflict handler returned `false`
    Rejected,
    /// The conflict handler returned an error or panicked
    HandlerFailed(String),
    /// The conflict resolver returned an error or panicked
    ResolverFailed(String),
}

impl fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictCause::Rejected => write!(f, "rejected by conflict handler"),
            ConflictCause::HandlerFailed(msg) => write!(f, "conflict handler failed: {msg}"),
            ConflictCause::ResolverFailed(msg) => write!(f, "conflict resolver failed: {msg}"),
        }
    }
}

/// Client error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Conflict on document {doc_id}: {cause}")]
    Conflict { doc_id: String, cause: ConflictCause },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Database is not open")]
    NotOpen,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] harbor_engine::Error),

    #[error("Replication error {code}: {message}")]
    Replication { code: i32, message: String },
}

impl Error {
    /// Error domain; engine errors keep the engine's domain.
    pub fn domain(&self) -> &'static str {
        match self {
            Error::Engine(e) => e.domain(),
            Error::Replication { .. } => "replication",
            _ => ERROR_DOMAIN,
        }
    }

    /// Numeric code within [`Error::domain`].
    pub fn code(&self) -> i32 {
        match self {
            Error::Conflict { .. } => 409,
            Error::NotFound(_) => 404,
            Error::Unexpected(_) => 500,
            Error::Busy(_) => 503,
            Error::Cancelled(_) => 499,
            Error::NotOpen => 410,
            Error::Config(_) => 400,
            Error::Engine(e) => e.code(),
            Error::Replication { code, .. } => *code,
        }
    }

    /// True for optimistic-concurrency conflicts from either layer.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Engine(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_messages_distinguish_causes() {
        let rejected = Error::Conflict {
            doc_id: "doc-1".into(),
            cause: ConflictCause::Rejected,
        };
        assert_eq!(
            rejected.to_string(),
            "Conflict on document doc-1: rejected by conflict handler"
        );

        let failed = Error::Conflict {
            doc_id: "doc-1".into(),
            cause: ConflictCause::HandlerFailed("boom".into()),
        };
        assert_eq!(
            failed.to_string(),
            "Conflict on document doc-1: conflict handler failed: boom"
        );
    }

    #[test]
    fn engine_errors_keep_domain_and_code() {
        let err: Error = harbor_engine::Error::NotFound("doc".into()).into();
        assert_eq!(err.domain(), harbor_engine::ERROR_DOMAIN);
        assert_eq!(err.code(), 404);

        let err: Error = harbor_engine::Error::Conflict("doc".into()).into();
        assert!(err.is_conflict());
        assert_eq!(Error::Busy("x".into()).domain(), ERROR_DOMAIN);
    }
}
