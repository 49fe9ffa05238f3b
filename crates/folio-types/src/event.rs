//! Event types for the Folio job event bus.
//!
//! `JobEvent` is broadcast while the coordinator drives a job. All variants
//! are Clone + Send + Sync for use with tokio broadcast channels. Events are
//! not persisted; the durable record is `WorkflowState::logs`.

use serde::{Deserialize, Serialize};

use crate::workflow::JobPhase;

/// Events emitted during batch job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// The splitter partitioned the inputs.
    JobStarted { job_id: String, total_units: usize },

    /// A wave was committed and is about to run.
    WaveDispatched {
        job_id: String,
        wave: u32,
        unit_ids: Vec<String>,
    },

    /// A unit produced an output.
    UnitCompleted {
        job_id: String,
        unit_id: String,
        duration_ms: u64,
    },

    /// A unit failed; `will_retry` is false when the budget is exhausted.
    UnitFailed {
        job_id: String,
        unit_id: String,
        error: String,
        will_retry: bool,
    },

    /// A unit exhausted its retry budget and is left out of the artifact.
    UnitAbandoned {
        job_id: String,
        unit_id: String,
        retry_count: u32,
    },

    /// The coordinator stopped in `phase`.
    JobFinished {
        job_id: String,
        phase: JobPhase,
        completed: usize,
        abandoned: usize,
    },
}

impl JobEvent {
    /// The job this event belongs to.
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::JobStarted { job_id, .. }
            | JobEvent::WaveDispatched { job_id, .. }
            | JobEvent::UnitCompleted { job_id, .. }
            | JobEvent::UnitFailed { job_id, .. }
            | JobEvent::UnitAbandoned { job_id, .. }
            | JobEvent::JobFinished { job_id, .. } => job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagged_snake_case() {
        let event = JobEvent::UnitFailed {
            job_id: "job-1".to_string(),
            unit_id: "unit-0002".to_string(),
            error: "timeout".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"unit_failed\""));
        assert!(json.contains("\"will_retry\":true"));
    }

    #[test]
    fn test_job_id_accessor() {
        let event = JobEvent::JobFinished {
            job_id: "job-9".to_string(),
            phase: JobPhase::Done,
            completed: 3,
            abandoned: 0,
        };
        assert_eq!(event.job_id(), "job-9");
    }
}
