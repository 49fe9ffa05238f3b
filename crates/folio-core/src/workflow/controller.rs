//! Execution controller: the public surface for starting and observing jobs.
//!
//! Creates the initial snapshot, hands executions to a `JobRunner`, and
//! composes the persisted snapshot with live runner state for status queries.
//! Never writes a snapshot after creation; the coordinator owns that.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use folio_types::error::RepositoryError;
use folio_types::workflow::{
    CancelOutcome, ExecutionRef, JobPhase, JobStatus, JobSummary, Progress, RunnerStatus,
    WorkflowState,
};
use serde_json::Value;

use crate::repository::state_store::StateStore;

use super::runner::{JobRunner, RunnerError, TriggerParams};

// ---------------------------------------------------------------------------
// Errors and handles
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("job '{0}' already exists")]
    JobExists(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("job '{job_id}' already finished ({phase})")]
    JobFinished { job_id: String, phase: JobPhase },

    #[error("job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("state store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// Returned by `start` and `resume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub execution: ExecutionRef,
}

// ---------------------------------------------------------------------------
// ExecutionController
// ---------------------------------------------------------------------------

pub struct ExecutionController<S, R> {
    store: Arc<S>,
    runner: Arc<R>,
    /// Latest execution per job id.
    executions: DashMap<String, ExecutionRef>,
    /// Job ids with a `start` in progress.
    starting: DashSet<String>,
    recent_log_limit: usize,
}

/// Releases a `start` claim when dropped.
struct StartClaim<'a> {
    starting: &'a DashSet<String>,
    job_id: &'a str,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        self.starting.remove(self.job_id);
    }
}

impl<S: StateStore, R: JobRunner> ExecutionController<S, R> {
    pub fn new(store: Arc<S>, runner: Arc<R>, recent_log_limit: usize) -> Self {
        Self {
            store,
            runner,
            executions: DashMap::new(),
            starting: DashSet::new(),
            recent_log_limit,
        }
    }

    /// Create the snapshot for a new job and trigger its first execution.
    pub async fn start(
        &self,
        job_id: &str,
        inputs: Vec<Value>,
        params: TriggerParams,
    ) -> Result<JobHandle, ControllerError> {
        if !self.starting.insert(job_id.to_string()) {
            return Err(ControllerError::JobExists(job_id.to_string()));
        }
        let _claim = StartClaim {
            starting: &self.starting,
            job_id,
        };

        if self.executions.contains_key(job_id) || self.store.load(job_id).await?.is_some() {
            return Err(ControllerError::JobExists(job_id.to_string()));
        }

        let mut state = WorkflowState::new(job_id, inputs);
        state.log(format!("job created with {} inputs", state.all_inputs.len()));
        self.store.save(job_id, &state).await?;
        tracing::info!(job_id, inputs = state.all_inputs.len(), "job created");

        self.trigger(job_id, params).await
    }

    /// Re-trigger a job whose snapshot is not terminal.
    pub async fn resume(
        &self,
        job_id: &str,
        params: TriggerParams,
    ) -> Result<JobHandle, ControllerError> {
        let state = self
            .store
            .load(job_id)
            .await?
            .ok_or_else(|| ControllerError::JobNotFound(job_id.to_string()))?;
        if state.phase.is_terminal() {
            return Err(ControllerError::JobFinished {
                job_id: job_id.to_string(),
                phase: state.phase,
            });
        }
        if let Some(RunnerStatus::Running) = self.runner_status(job_id).await? {
            return Err(ControllerError::AlreadyRunning(job_id.to_string()));
        }

        tracing::info!(job_id, phase = %state.phase, "resuming job");
        self.trigger(job_id, params).await
    }

    /// Current status of `job_id`. Safe to call while the job runs.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus, ControllerError> {
        let snapshot = self.store.load(job_id).await?;
        let runner = self.runner_status(job_id).await?;
        compose_status(job_id, snapshot.as_ref(), runner, self.recent_log_limit)
            .ok_or_else(|| ControllerError::JobNotFound(job_id.to_string()))
    }

    /// Request cooperative cancellation of the job's running execution.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, ControllerError> {
        let Some(execution) = self.latest_execution(job_id) else {
            return Ok(CancelOutcome::NoOp);
        };
        if self.runner.cancel(&execution).await? {
            Ok(CancelOutcome::Accepted)
        } else {
            Ok(CancelOutcome::NoOp)
        }
    }

    /// Poll `status` every `poll_interval` until the runner has exited.
    pub async fn wait(
        &self,
        job_id: &str,
        poll_interval: Duration,
    ) -> Result<JobStatus, ControllerError> {
        loop {
            let status = self.status(job_id).await?;
            if !status.runner.as_ref().is_some_and(RunnerStatus::is_running) {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// The full stored snapshot, including the artifact.
    pub async fn snapshot(&self, job_id: &str) -> Result<WorkflowState, ControllerError> {
        self.store
            .load(job_id)
            .await?
            .ok_or_else(|| ControllerError::JobNotFound(job_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<JobSummary>, ControllerError> {
        Ok(self.store.list_jobs().await?)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn trigger(&self, job_id: &str, params: TriggerParams) -> Result<JobHandle, ControllerError> {
        let execution = match self.runner.trigger(job_id, params).await {
            Ok(execution) => execution,
            Err(RunnerError::AlreadyRunning(id)) => return Err(ControllerError::AlreadyRunning(id)),
            Err(e) => return Err(e.into()),
        };
        self.executions
            .insert(job_id.to_string(), execution.clone());
        Ok(JobHandle {
            job_id: job_id.to_string(),
            execution,
        })
    }

    fn latest_execution(&self, job_id: &str) -> Option<ExecutionRef> {
        self.executions.get(job_id).map(|e| e.value().clone())
    }

    async fn runner_status(&self, job_id: &str) -> Result<Option<RunnerStatus>, ControllerError> {
        match self.latest_execution(job_id) {
            Some(execution) => Ok(Some(self.runner.poll(&execution).await?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Status composition
// ---------------------------------------------------------------------------

/// Combine a snapshot (if any) with the runner's view (if any).
///
/// - snapshot absent, runner running: `splitting` (the snapshot is about to
///   be written);
/// - runner exited while the snapshot is still mid-flight: `stale`, and the
///   phase follows the runner (`failed`, `cancelled`, or `crashed` when it
///   reported success);
/// - neither: `None`.
pub fn compose_status(
    job_id: &str,
    snapshot: Option<&WorkflowState>,
    runner: Option<RunnerStatus>,
    recent_log_limit: usize,
) -> Option<JobStatus> {
    let exited_phase = |runner: &RunnerStatus| match runner {
        RunnerStatus::Running => JobPhase::Splitting,
        RunnerStatus::Succeeded => JobPhase::Crashed,
        RunnerStatus::Failed { .. } => JobPhase::Failed,
        RunnerStatus::Cancelled => JobPhase::Cancelled,
    };
    let runner_error = |runner: &RunnerStatus| match runner {
        RunnerStatus::Failed { error } => Some(error.clone()),
        _ => None,
    };

    match (snapshot, runner) {
        (None, None) => None,
        (None, Some(runner)) => Some(JobStatus {
            job_id: job_id.to_string(),
            phase: exited_phase(&runner),
            progress: Progress::default(),
            recent_logs: Vec::new(),
            abandoned_ids: Vec::new(),
            error: runner_error(&runner),
            stale: !runner.is_running(),
            runner: Some(runner),
        }),
        (Some(state), runner) => {
            let mut phase = state.phase;
            let mut error = state.error.clone();
            let mut stale = false;

            if let Some(runner) = runner.as_ref().filter(|r| !r.is_running()) {
                let settled = state.phase.is_terminal() || state.phase == JobPhase::Failed;
                if !settled {
                    stale = true;
                    phase = exited_phase(runner);
                    error = runner_error(runner).or(error);
                }
            }

            Some(JobStatus {
                job_id: state.job_id.clone(),
                phase,
                progress: state.progress(),
                recent_logs: state.recent_logs(recent_log_limit),
                abandoned_ids: state.abandoned_ids.iter().cloned().collect(),
                runner,
                error,
                stale,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::bus::EventBus;
    use crate::repository::memory::InMemoryStateStore;
    use crate::workflow::coordinator::BatchCoordinator;
    use crate::workflow::executor::{UnitError, UnitExecutor};
    use crate::workflow::runner::LocalJobRunner;
    use folio_types::config::EngineConfig;
    use folio_types::workflow::WorkItem;
    use serde_json::json;
    use tokio::sync::Semaphore;

    /// Each unit consumes one permit before producing its section.
    struct Gate {
        release: Arc<Semaphore>,
    }

    impl UnitExecutor for Gate {
        async fn run(&self, item: &WorkItem) -> Result<Value, UnitError> {
            self.release
                .acquire()
                .await
                .map_err(|e| UnitError::Failed(e.to_string()))?
                .forget();
            Ok(json!(format!("section {}", item.id)))
        }
    }

    fn gate() -> Arc<Semaphore> {
        Arc::new(Semaphore::new(0))
    }

    type Controller = ExecutionController<InMemoryStateStore, LocalJobRunner<InMemoryStateStore, Gate>>;

    fn controller(release: Arc<Semaphore>, concurrency: usize) -> (Controller, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let config = EngineConfig {
            concurrency,
            ..EngineConfig::default()
        };
        let coordinator = BatchCoordinator::new(
            Arc::clone(&store),
            Arc::new(Gate { release }),
            config,
            EventBus::default(),
        );
        let runner = Arc::new(LocalJobRunner::new(coordinator));
        (
            ExecutionController::new(Arc::clone(&store), runner, 20),
            store,
        )
    }

    fn inputs(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"n": i})).collect()
    }

    const POLL: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn test_start_and_wait_until_done() {
        let release = gate();
        let (controller, _store) = controller(Arc::clone(&release), 4);

        let handle = controller
            .start("job-1", inputs(1), TriggerParams::default())
            .await
            .unwrap();
        assert_eq!(handle.job_id, "job-1");
        release.add_permits(1);

        let status = controller.wait("job-1", POLL).await.unwrap();
        assert_eq!(status.phase, JobPhase::Done);
        assert_eq!(status.progress.completed, 1);
        assert!(status.fully_succeeded());
        assert!(!status.stale);
        assert_eq!(status.runner, Some(RunnerStatus::Succeeded));

        let snapshot = controller.snapshot("job-1").await.unwrap();
        assert_eq!(snapshot.final_artifact.unwrap().document, "section unit-0001");
    }

    #[tokio::test]
    async fn test_start_rejects_existing_job() {
        let release = gate();
        let (controller, store) = controller(release, 1);
        store
            .save("job-1", &WorkflowState::new("job-1", vec![]))
            .await
            .unwrap();

        let err = controller
            .start("job-1", inputs(1), TriggerParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::JobExists(id) if id == "job-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_create_one_job() {
        let release = gate();
        let (controller, store) = controller(Arc::clone(&release), 2);
        let controller = Arc::new(controller);

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8 {
            let controller = Arc::clone(&controller);
            tasks.spawn(async move {
                controller
                    .start("job-1", inputs(n + 1), TriggerParams::default())
                    .await
            });
        }
        let mut started = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(_) => started += 1,
                Err(err) => assert!(matches!(err, ControllerError::JobExists(_))),
            }
        }
        assert_eq!(started, 1);

        let stored = store.load("job-1").await.unwrap().unwrap();
        release.add_permits(stored.all_inputs.len());
        let status = controller.wait("job-1", POLL).await.unwrap();
        assert_eq!(status.phase, JobPhase::Done);
        assert_eq!(status.progress.total, stored.all_inputs.len());
    }

    #[tokio::test]
    async fn test_status_while_running_reports_progress() {
        let release = gate();
        let (controller, _store) = controller(Arc::clone(&release), 1);
        controller
            .start("job-1", inputs(2), TriggerParams::default())
            .await
            .unwrap();

        let status = controller.status("job-1").await.unwrap();
        assert_eq!(status.runner, Some(RunnerStatus::Running));
        assert!(!status.stale);
        assert!(!status.phase.is_terminal());

        release.add_permits(2);
        let done = controller.wait("job-1", POLL).await.unwrap();
        assert_eq!(done.phase, JobPhase::Done);
        assert_eq!(done.progress.total, 2);
    }

    #[tokio::test]
    async fn test_cancel_accepted_then_noop() {
        let release = gate();
        let (controller, _store) = controller(Arc::clone(&release), 1);
        controller
            .start("job-1", inputs(3), TriggerParams::default())
            .await
            .unwrap();

        assert_eq!(controller.cancel("job-1").await.unwrap(), CancelOutcome::Accepted);
        release.add_permits(1);

        let status = controller.wait("job-1", POLL).await.unwrap();
        assert_eq!(status.phase, JobPhase::Cancelled);
        assert_eq!(status.runner, Some(RunnerStatus::Cancelled));
        assert_eq!(controller.cancel("job-1").await.unwrap(), CancelOutcome::NoOp);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_noop() {
        let (controller, _store) = controller(gate(), 1);
        assert_eq!(controller.cancel("nope").await.unwrap(), CancelOutcome::NoOp);
    }

    #[tokio::test]
    async fn test_resume_cancelled_job_rejected() {
        let release = gate();
        let (controller, _store) = controller(Arc::clone(&release), 1);
        controller
            .start("job-1", inputs(2), TriggerParams::default())
            .await
            .unwrap();
        controller.cancel("job-1").await.unwrap();
        release.add_permits(1);
        controller.wait("job-1", POLL).await.unwrap();

        let err = controller
            .resume("job-1", TriggerParams::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::JobFinished {
                phase: JobPhase::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resume_interrupted_job_completes() {
        let release = gate();
        let (controller, store) = controller(Arc::clone(&release), 2);
        let state = WorkflowState::new("job-1", inputs(2));
        store.save("job-1", &state).await.unwrap();

        controller
            .resume("job-1", TriggerParams::default())
            .await
            .unwrap();
        release.add_permits(2);

        let status = controller.wait("job-1", POLL).await.unwrap();
        assert_eq!(status.phase, JobPhase::Done);
        assert_eq!(status.progress.completed, 2);
    }

    #[tokio::test]
    async fn test_resume_unknown_job() {
        let (controller, _store) = controller(gate(), 1);
        let err = controller
            .resume("ghost", TriggerParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_status_unknown_job() {
        let (controller, _store) = controller(gate(), 1);
        let err = controller.status("ghost").await.unwrap_err();
        assert!(matches!(err, ControllerError::JobNotFound(_)));
    }

    // -------------------------------------------------------------------
    // compose_status
    // -------------------------------------------------------------------

    fn snapshot(phase: JobPhase) -> WorkflowState {
        let mut state = WorkflowState::new("job-1", vec![]);
        state.phase = phase;
        state
    }

    #[test]
    fn test_compose_neither_is_none() {
        assert!(compose_status("job-1", None, None, 10).is_none());
    }

    #[test]
    fn test_compose_runner_only_running_is_splitting() {
        let status = compose_status("job-1", None, Some(RunnerStatus::Running), 10).unwrap();
        assert_eq!(status.phase, JobPhase::Splitting);
        assert!(!status.stale);
    }

    #[test]
    fn test_compose_runner_failed_before_snapshot() {
        let runner = RunnerStatus::Failed {
            error: "store unavailable".to_string(),
        };
        let status = compose_status("job-1", None, Some(runner), 10).unwrap();
        assert_eq!(status.phase, JobPhase::Failed);
        assert_eq!(status.error.as_deref(), Some("store unavailable"));
        assert!(status.stale);
    }

    #[test]
    fn test_compose_snapshot_only() {
        let state = snapshot(JobPhase::Waiting);
        let status = compose_status("job-1", Some(&state), None, 10).unwrap();
        assert_eq!(status.phase, JobPhase::Waiting);
        assert!(status.runner.is_none());
        assert!(!status.stale);
    }

    #[test]
    fn test_compose_runner_failed_mid_flight_is_stale_failed() {
        let state = snapshot(JobPhase::Waiting);
        let runner = RunnerStatus::Failed {
            error: "job 'job-1' exceeded its wave budget of 3".to_string(),
        };
        let status = compose_status("job-1", Some(&state), Some(runner), 10).unwrap();
        assert_eq!(status.phase, JobPhase::Failed);
        assert!(status.stale);
        assert!(status.error.unwrap().contains("wave budget"));
    }

    #[test]
    fn test_compose_runner_succeeded_mid_flight_is_crashed() {
        let state = snapshot(JobPhase::Dispatching);
        let status =
            compose_status("job-1", Some(&state), Some(RunnerStatus::Succeeded), 10).unwrap();
        assert_eq!(status.phase, JobPhase::Crashed);
        assert!(status.stale);
    }

    #[test]
    fn test_compose_runner_cancelled_mid_flight() {
        let state = snapshot(JobPhase::Retrying);
        let status =
            compose_status("job-1", Some(&state), Some(RunnerStatus::Cancelled), 10).unwrap();
        assert_eq!(status.phase, JobPhase::Cancelled);
        assert!(status.stale);
    }

    #[test]
    fn test_compose_terminal_snapshot_wins() {
        let state = snapshot(JobPhase::Done);
        let status =
            compose_status("job-1", Some(&state), Some(RunnerStatus::Succeeded), 10).unwrap();
        assert_eq!(status.phase, JobPhase::Done);
        assert!(!status.stale);
    }

    #[test]
    fn test_compose_persisted_failure_keeps_its_error() {
        let mut state = snapshot(JobPhase::Failed);
        state.error = Some("completed unit 'unit-0001' has no result".to_string());
        let runner = RunnerStatus::Failed {
            error: "finalization failed".to_string(),
        };
        let status = compose_status("job-1", Some(&state), Some(runner), 10).unwrap();
        assert_eq!(status.phase, JobPhase::Failed);
        assert!(!status.stale);
        assert!(status.error.unwrap().contains("unit-0001"));
    }

    #[test]
    fn test_compose_limits_recent_logs() {
        let mut state = snapshot(JobPhase::Waiting);
        for i in 0..30 {
            state.log(format!("event {i}"));
        }
        let status = compose_status("job-1", Some(&state), None, 5).unwrap();
        assert_eq!(status.recent_logs.len(), 5);
        assert_eq!(status.recent_logs[4].message, "event 29");
    }
}
