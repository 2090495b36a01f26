//! Error types for the Harbor storage engine.

use crate::DocumentId;
use thiserror::Error;

/// Domain tag carried by every engine error when it crosses into the client.
pub const ERROR_DOMAIN: &str = "harbor-engine";

/// All possible errors from the storage engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Revision errors
    #[error("revision conflict on document {0}")]
    Conflict(DocumentId),

    #[error("document not found: {0}")]
    NotFound(DocumentId),

    #[error("invalid revision id: {0}")]
    InvalidRevisionId(String),

    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(DocumentId),

    // Transaction errors
    #[error("no transaction is open")]
    NoTransaction,

    #[error("transaction aborted by a nested rollback")]
    TransactionAborted,
}

impl Error {
    /// True for the optimistic-concurrency failure; every other variant is a hard error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Error domain for wrapping by higher layers.
    pub fn domain(&self) -> &'static str {
        ERROR_DOMAIN
    }

    /// Stable numeric code within [`ERROR_DOMAIN`].
    pub fn code(&self) -> i32 {
        match self {
            Error::Conflict(_) => 409,
            Error::NotFound(_) => 404,
            Error::InvalidDocumentId(_) => 400,
            Error::InvalidRevisionId(_) => 422,
            Error::NoTransaction => 500,
            Error::TransactionAborted => 501,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
