//! Workflow domain types for Folio.
//!
//! Defines the persisted snapshot model (`WorkflowState`) that the batch
//! coordinator commits after every wave, the per-unit bookkeeping
//! (`WorkItem`, `UnitStatus`, `StatusUpdate`), the final `Artifact`, and the
//! read-only projections served to status queries (`JobStatus`, `Progress`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// One cluster of input records dispatched to an executor as a single unit.
///
/// Created by the splitter and never mutated afterwards. The engine treats
/// `payload` as opaque; only executors look inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Deterministic id (`unit-0001`, `unit-0002`, ...) in cluster order.
    pub id: String,
    /// The cluster's input records (a JSON array).
    pub payload: Value,
    /// Partition metadata for observability.
    pub meta: WorkItemMeta,
}

/// Where a work item came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemMeta {
    /// Partition key (topic, source file, chunk label).
    pub group_key: String,
    /// Positions of the cluster's records in `WorkflowState::all_inputs`.
    pub input_indices: Vec<usize>,
}

// ---------------------------------------------------------------------------
// Unit status
// ---------------------------------------------------------------------------

/// Lifecycle state of a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Active,
    Completed,
    Failed,
}

/// Per-unit bookkeeping stored in `WorkflowState::unit_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub state: UnitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of failed attempts so far. Never decreases.
    #[serde(default)]
    pub retry_count: u32,
}

impl UnitStatus {
    /// A fresh, never-dispatched unit.
    pub fn pending() -> Self {
        Self {
            state: UnitState::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            retry_count: 0,
        }
    }
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self::pending()
    }
}

/// A proposed change to one `UnitStatus`.
///
/// Unit executions never write the snapshot; the coordinator turns their
/// outcomes into updates and merges them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: UnitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The `retry_count` the unit had when the reporting attempt was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Explicit retry count override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl StatusUpdate {
    /// Unit dispatched at `at`.
    pub fn active(at: DateTime<Utc>) -> Self {
        Self {
            state: UnitState::Active,
            started_at: Some(at),
            ended_at: None,
            error: None,
            attempt: None,
            retry_count: None,
        }
    }

    /// Attempt `attempt` finished successfully at `at`.
    pub fn completed(attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            state: UnitState::Completed,
            started_at: None,
            ended_at: Some(at),
            error: None,
            attempt: Some(attempt),
            retry_count: None,
        }
    }

    /// Attempt `attempt` failed at `at`.
    pub fn failed(attempt: u32, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            state: UnitState::Failed,
            started_at: None,
            ended_at: Some(at),
            error: Some(error.into()),
            attempt: Some(attempt),
            retry_count: None,
        }
    }

    /// Unit returned to the queue for redispatch.
    pub fn requeued() -> Self {
        Self {
            state: UnitState::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            attempt: None,
            retry_count: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Job phase
// ---------------------------------------------------------------------------

/// Coordinator phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Splitting,
    Dispatching,
    Waiting,
    Retrying,
    Finalizing,
    Done,
    Cancelled,
    /// Finalization or coordinator failure. Distinct from `Done` and `Cancelled`.
    Failed,
    /// Reported by status queries only: the runner exited but the snapshot
    /// never reached a terminal phase.
    Crashed,
}

impl JobPhase {
    /// `Done` and `Cancelled` snapshots are never touched again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Splitting => "splitting",
            JobPhase::Dispatching => "dispatching",
            JobPhase::Waiting => "waiting",
            JobPhase::Retrying => "retrying",
            JobPhase::Finalizing => "finalizing",
            JobPhase::Done => "done",
            JobPhase::Cancelled => "cancelled",
            JobPhase::Failed => "failed",
            JobPhase::Crashed => "crashed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Results and artifact
// ---------------------------------------------------------------------------

/// One completed unit output, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub unit_id: String,
    pub output: Value,
}

/// A human-readable progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// One section of the final document, in cluster order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSection {
    pub unit_id: String,
    pub group_key: String,
    pub output: Value,
}

/// The reduced output of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub sections: Vec<ArtifactSection>,
    /// Abandoned unit ids left out of the document.
    #[serde(default)]
    pub omitted: Vec<String>,
    /// Rendered document text.
    pub document: String,
    /// `false` when any unit was abandoned.
    pub complete: bool,
    pub assembled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkflowState (the persisted snapshot)
// ---------------------------------------------------------------------------

/// The full persisted snapshot of one job.
///
/// Written only by the batch coordinator, once per dispatch and once per
/// merged wave. Immutable once `final_artifact` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub job_id: String,
    pub phase: JobPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fatal error message when `phase` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Raw input records, write-once.
    pub all_inputs: Vec<Value>,
    /// Static partition of `all_inputs`, set once by the splitter.
    #[serde(default)]
    pub all_clusters: Vec<WorkItem>,
    #[serde(default)]
    pub unit_status: BTreeMap<String, UnitStatus>,
    /// FIFO queue of ids awaiting dispatch.
    #[serde(default)]
    pub pending: Vec<String>,
    /// Ids of the dispatched wave that has not been merged yet.
    #[serde(default)]
    pub in_flight: Vec<String>,
    /// Waves dispatched so far.
    #[serde(default)]
    pub wave: u32,
    #[serde(default)]
    pub dispatched_count: u64,
    #[serde(default)]
    pub last_wave_size: usize,

    #[serde(default)]
    pub partial_results: Vec<PartialResult>,
    #[serde(default)]
    pub results_by_id: BTreeMap<String, Value>,
    #[serde(default)]
    pub requested_ids: BTreeSet<String>,
    #[serde(default)]
    pub abandoned_ids: BTreeSet<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_artifact: Option<Artifact>,
}

impl WorkflowState {
    /// Create the initial snapshot for a job: inputs recorded, nothing split yet.
    pub fn new(job_id: impl Into<String>, inputs: Vec<Value>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            phase: JobPhase::Splitting,
            created_at: now,
            updated_at: now,
            error: None,
            all_inputs: inputs,
            all_clusters: Vec::new(),
            unit_status: BTreeMap::new(),
            pending: Vec::new(),
            in_flight: Vec::new(),
            wave: 0,
            dispatched_count: 0,
            last_wave_size: 0,
            partial_results: Vec::new(),
            results_by_id: BTreeMap::new(),
            requested_ids: BTreeSet::new(),
            abandoned_ids: BTreeSet::new(),
            logs: Vec::new(),
            final_artifact: None,
        }
    }

    /// Append a progress log entry.
    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Look up a cluster by id.
    pub fn cluster(&self, id: &str) -> Option<&WorkItem> {
        self.all_clusters.iter().find(|c| c.id == id)
    }

    /// Whether the unit with `id` has reached `Completed`.
    pub fn is_completed(&self, id: &str) -> bool {
        self.unit_status
            .get(id)
            .is_some_and(|s| s.state == UnitState::Completed)
    }

    /// `requested_ids − completed − abandoned`, in id order.
    pub fn missing_ids(&self) -> Vec<String> {
        self.requested_ids
            .iter()
            .filter(|id| !self.is_completed(id) && !self.abandoned_ids.contains(*id))
            .cloned()
            .collect()
    }

    /// Whether the job already produced its artifact.
    pub fn is_finalized(&self) -> bool {
        self.final_artifact.is_some()
    }

    /// Counts for status reporting.
    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.requested_ids.len(),
            abandoned: self.abandoned_ids.len(),
            ..Progress::default()
        };
        for status in self.unit_status.values() {
            match status.state {
                UnitState::Completed => progress.completed += 1,
                UnitState::Active => progress.active += 1,
                UnitState::Pending => progress.pending += 1,
                UnitState::Failed => {}
            }
        }
        progress
    }

    /// The last `limit` log entries, oldest first.
    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        let start = self.logs.len().saturating_sub(limit);
        self.logs[start..].to_vec()
    }
}

// ---------------------------------------------------------------------------
// Status projection
// ---------------------------------------------------------------------------

/// Unit counts for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub abandoned: usize,
    pub active: usize,
    pub pending: usize,
}

/// Lightweight listing row for stored jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub phase: JobPhase,
    pub updated_at: DateTime<Utc>,
}

/// Handle to one execution of a job on a job runner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionRef {
    pub id: Uuid,
    pub job_id: String,
}

/// Live state of an execution as reported by the job runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunnerStatus {
    Running,
    Succeeded,
    Failed { error: String },
    Cancelled,
}

impl RunnerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, RunnerStatus::Running)
    }
}

/// Read-only status projection served to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub phase: JobPhase,
    pub progress: Progress,
    pub recent_logs: Vec<LogEntry>,
    pub abandoned_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The snapshot lags the runner (the runner exited first).
    pub stale: bool,
}

impl JobStatus {
    /// Finished with every requested unit present in the artifact.
    pub fn fully_succeeded(&self) -> bool {
        self.phase == JobPhase::Done && self.abandoned_ids.is_empty()
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Accepted,
    NoOp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
