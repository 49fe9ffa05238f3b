//! Workflow snapshot store trait definition.
//!
//! The batch coordinator is the only writer: it replaces the whole snapshot
//! for a job once per dispatched wave and once per merged wave. Readers
//! (status queries) may load concurrently.

use folio_types::error::RepositoryError;
use folio_types::workflow::{JobSummary, WorkflowState};

/// Durable key-value persistence of `WorkflowState`, keyed by job id.
///
/// `save` must atomically replace the stored snapshot; a later `load` returns
/// a value equal to the last successful `save`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateStore: Send + Sync {
    /// Load the snapshot for `job_id`. Returns `None` if the job is unknown.
    fn load(
        &self,
        job_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowState>, RepositoryError>> + Send;

    /// Atomically replace the snapshot for `job_id`.
    fn save(
        &self,
        job_id: &str,
        state: &WorkflowState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List stored jobs, most recently updated first.
    fn list_jobs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<JobSummary>, RepositoryError>> + Send;
}
