//! In-memory `StateStore` backed by a `DashMap`.
//!
//! Snapshots are stored serialized, so a `load` hands back an independent
//! copy and a value that does not survive JSON encoding fails at `save` time,
//! exactly as it would against the SQLite store.

use dashmap::DashMap;
use folio_types::error::RepositoryError;
use folio_types::workflow::{JobSummary, WorkflowState};

use super::state_store::StateStore;

/// Process-local snapshot store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    snapshots: DashMap<String, String>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Overwrite a job's stored bytes verbatim. Lets tests plant a corrupt
    /// snapshot.
    pub fn insert_raw(&self, job_id: &str, raw: impl Into<String>) {
        self.snapshots.insert(job_id.to_string(), raw.into());
    }

    fn decode(job_id: &str, raw: &str) -> Result<WorkflowState, RepositoryError> {
        serde_json::from_str(raw).map_err(|e| RepositoryError::Corrupt {
            job_id: job_id.to_string(),
            reason: e.to_string(),
        })
    }
}

impl StateStore for InMemoryStateStore {
    async fn load(&self, job_id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        match self.snapshots.get(job_id) {
            Some(raw) => Ok(Some(Self::decode(job_id, raw.value())?)),
            None => Ok(None),
        }
    }

    async fn save(&self, job_id: &str, state: &WorkflowState) -> Result<(), RepositoryError> {
        let raw = serde_json::to_string(state)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize snapshot: {e}")))?;
        self.snapshots.insert(job_id.to_string(), raw);
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobSummary>, RepositoryError> {
        let mut jobs = Vec::with_capacity(self.snapshots.len());
        for entry in self.snapshots.iter() {
            let state = Self::decode(entry.key(), entry.value())?;
            jobs.push(JobSummary {
                job_id: state.job_id,
                phase: state.phase,
                updated_at: state.updated_at,
            });
        }
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_types::workflow::JobPhase;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let store = InMemoryStateStore::new();
        let mut state = WorkflowState::new("job-1", vec![json!({"topic": "rust"})]);
        state.log("created");

        store.save("job-1", &state).await.unwrap();
        let loaded = store.load("job-1").await.unwrap();
        assert_eq!(loaded, Some(state));
    }

    #[tokio::test]
    async fn test_load_unknown_returns_none() {
        let store = InMemoryStateStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_snapshot() {
        let store = InMemoryStateStore::new();
        let mut state = WorkflowState::new("job-1", vec![]);
        store.save("job-1", &state).await.unwrap();

        state.phase = JobPhase::Done;
        store.save("job-1", &state).await.unwrap();

        let loaded = store.load("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.phase, JobPhase::Done);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_surfaces_error() {
        let store = InMemoryStateStore::new();
        store.insert_raw("job-x", "{not json");
        let err = store.load("job-x").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first() {
        let store = InMemoryStateStore::new();
        let older = WorkflowState::new("older", vec![]);
        let mut newer = WorkflowState::new("newer", vec![]);
        newer.updated_at = older.updated_at + chrono::Duration::seconds(5);

        store.save("older", &older).await.unwrap();
        store.save("newer", &newer).await.unwrap();

        let jobs = store.list_jobs().await.unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
    }
}
