//! Crate-wide error type.
//!
//! Every task phase and collaborator call returns [`Result`]. The variants
//! line up with the error kinds enumerated in the task subsystem design:
//! validation, collaborator I/O, missing precondition, cancellation, and
//! configuration. Best-effort cleanup failures (lock-contended partition
//! removal, tSafe watch attach) are logged at the call site and never
//! constructed as one of these variants.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryNodeError>;

#[derive(Error, Debug)]
pub enum QueryNodeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing precondition: {0}")]
    MissingPrecondition(String),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryNodeError {
    pub fn collection_not_found(collection_id: i64) -> Self {
        QueryNodeError::MissingPrecondition(format!("cannot find collection {collection_id}"))
    }

    pub fn duplicate_vchannel(name: &str) -> Self {
        QueryNodeError::Validation(format!("duplicate vchannel: {name}"))
    }
}

impl From<std::io::Error> for QueryNodeError {
    fn from(e: std::io::Error) -> Self {
        QueryNodeError::Collaborator(e.to_string())
    }
}
