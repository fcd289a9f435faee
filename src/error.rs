//! Error taxonomy surfaced by the pipeline's caller-facing operations.
//!
//! Row-level validation failures and ownership conflicts are data, not
//! errors — they live on the job record. This enum covers everything that
//! rejects an operation outright.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Structurally unusable input: empty source, unreadable row stream,
    /// unknown header set.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Job does not exist or belongs to a different brand. The two cases
    /// are deliberately indistinguishable to callers.
    #[error("job not found")]
    NotFound,

    /// Operation not valid from the job's current status.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Shared-secret mismatch or non-member actor. Rejected before any
    /// job mutation.
    #[error("unauthorized")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
