//! SQLite workflow snapshot store.
//!
//! Implements `StateStore` from `folio-core`. Each job is one row holding the
//! whole `WorkflowState` as JSON; `save` upserts it in a single statement so a
//! commit is atomic. The `phase` column duplicates the snapshot's phase for
//! cheap listings.

use chrono::{DateTime, SecondsFormat, Utc};
use folio_core::repository::state_store::StateStore;
use folio_types::error::RepositoryError;
use folio_types::workflow::{JobPhase, JobSummary, WorkflowState};
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `StateStore`.
pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps so `ORDER BY updated_at` sorts chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_phase(s: &str) -> Result<JobPhase, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| RepositoryError::Query(format!("invalid phase '{s}': {e}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// StateStore implementation
// ---------------------------------------------------------------------------

impl StateStore for SqliteStateStore {
    async fn load(&self, job_id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        let row = sqlx::query("SELECT snapshot FROM workflow_snapshots WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("snapshot").map_err(query_error)?;
        let state = serde_json::from_str(&raw).map_err(|e| RepositoryError::Corrupt {
            job_id: job_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(state))
    }

    async fn save(&self, job_id: &str, state: &WorkflowState) -> Result<(), RepositoryError> {
        let snapshot = serde_json::to_string(state)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize snapshot: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_snapshots (job_id, phase, snapshot, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (job_id) DO UPDATE SET
                   phase = excluded.phase,
                   snapshot = excluded.snapshot,
                   updated_at = excluded.updated_at"#,
        )
        .bind(job_id)
        .bind(state.phase.as_str())
        .bind(&snapshot)
        .bind(format_datetime(&state.created_at))
        .bind(format_datetime(&state.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        tracing::trace!(job_id, phase = %state.phase, bytes = snapshot.len(), "snapshot saved");
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT job_id, phase, updated_at FROM workflow_snapshots ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let job_id: String = row.try_get("job_id").map_err(query_error)?;
                let phase: String = row.try_get("phase").map_err(query_error)?;
                let updated_at: String = row.try_get("updated_at").map_err(query_error)?;
                Ok(JobSummary {
                    job_id,
                    phase: parse_phase(&phase)?,
                    updated_at: parse_datetime(&updated_at)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
