use thiserror::Error;

/// Errors from snapshot store operations (used by `StateStore` in folio-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("query error: {0}")]
    Query(String),

    /// A stored snapshot could not be decoded.
    #[error("corrupt snapshot for job '{job_id}': {reason}")]
    Corrupt { job_id: String, reason: String },
}
