//! Job runner port and the in-process implementation.
//!
//! A `JobRunner` hosts coordinator executions. The controller only ever talks
//! to it through `ExecutionRef` handles, so a remote runner can replace
//! `LocalJobRunner` without touching the engine.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use folio_types::workflow::{ExecutionRef, JobPhase, RunnerStatus};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::state_store::StateStore;

use super::coordinator::BatchCoordinator;
use super::executor::UnitExecutor;

// ---------------------------------------------------------------------------
// JobRunner trait
// ---------------------------------------------------------------------------

/// Per-execution overrides of the engine configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerParams {
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error("execution {0} not found")]
    UnknownExecution(Uuid),

    #[error("job '{0}' already has a running execution")]
    AlreadyRunning(String),
}

/// Starts, observes, and cancels coordinator executions.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait JobRunner: Send + Sync {
    fn trigger(
        &self,
        job_id: &str,
        params: TriggerParams,
    ) -> impl std::future::Future<Output = Result<ExecutionRef, RunnerError>> + Send;

    fn poll(
        &self,
        execution: &ExecutionRef,
    ) -> impl std::future::Future<Output = Result<RunnerStatus, RunnerError>> + Send;

    /// Request cooperative cancellation. Returns `false` when the execution
    /// had already exited.
    fn cancel(
        &self,
        execution: &ExecutionRef,
    ) -> impl std::future::Future<Output = Result<bool, RunnerError>> + Send;
}

// ---------------------------------------------------------------------------
// LocalJobRunner
// ---------------------------------------------------------------------------

struct Execution {
    job_id: String,
    cancel_token: CancellationToken,
    status: watch::Receiver<RunnerStatus>,
}

/// Runs each execution as a tokio task in this process.
///
/// Only the latest execution of each job is retained; triggering a job again
/// forgets the refs of its earlier, finished executions.
pub struct LocalJobRunner<S, E> {
    coordinator: BatchCoordinator<S, E>,
    executions: DashMap<Uuid, Execution>,
    /// Latest execution id per job id.
    latest: DashMap<String, Uuid>,
}

impl<S: StateStore + 'static, E: UnitExecutor + 'static> LocalJobRunner<S, E> {
    pub fn new(coordinator: BatchCoordinator<S, E>) -> Self {
        Self {
            coordinator,
            executions: DashMap::new(),
            latest: DashMap::new(),
        }
    }

    /// Wait for `execution` to exit and return its final status.
    pub async fn wait(&self, execution: &ExecutionRef) -> Result<RunnerStatus, RunnerError> {
        let mut rx = self
            .executions
            .get(&execution.id)
            .map(|e| e.status.clone())
            .ok_or(RunnerError::UnknownExecution(execution.id))?;

        if rx.wait_for(|s| !s.is_running()).await.is_err() {
            tracing::debug!(execution_id = %execution.id, "execution status channel closed");
        }
        let status = rx.borrow().clone();
        Ok(status)
    }

    fn is_running(&self, execution_id: &Uuid) -> bool {
        self.executions
            .get(execution_id)
            .is_some_and(|e| e.status.borrow().is_running())
    }
}

impl<S: StateStore + 'static, E: UnitExecutor + 'static> JobRunner for LocalJobRunner<S, E> {
    async fn trigger(&self, job_id: &str, params: TriggerParams) -> Result<ExecutionRef, RunnerError> {
        let mut coordinator = self.coordinator.clone();
        if let Some(concurrency) = params.concurrency {
            coordinator.config_mut().concurrency = concurrency;
        }
        if let Some(max_retries) = params.max_retries {
            coordinator.config_mut().max_retries = max_retries;
        }

        let execution = ExecutionRef {
            id: Uuid::now_v7(),
            job_id: job_id.to_string(),
        };
        let cancel_token = CancellationToken::new();
        let (tx, rx) = watch::channel(RunnerStatus::Running);
        let entry = Execution {
            job_id: job_id.to_string(),
            cancel_token: cancel_token.clone(),
            status: rx,
        };

        // The job's slot stays locked until the new execution is registered,
        // so concurrent triggers of one job cannot both pass the check.
        let previous = match self.latest.entry(job_id.to_string()) {
            Entry::Occupied(mut slot) => {
                if self.is_running(slot.get()) {
                    return Err(RunnerError::AlreadyRunning(job_id.to_string()));
                }
                self.executions.insert(execution.id, entry);
                Some(slot.insert(execution.id))
            }
            Entry::Vacant(slot) => {
                self.executions.insert(execution.id, entry);
                slot.insert(execution.id);
                None
            }
        };
        if let Some(previous) = previous {
            self.executions.remove(&previous);
        }

        tracing::info!(
            job_id,
            execution_id = %execution.id,
            "triggering job execution"
        );

        let owned_job_id = job_id.to_string();
        let task = tokio::spawn(async move { coordinator.run(&owned_job_id, &cancel_token).await });
        let execution_id = execution.id;
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let status = match task.await {
                Ok(Ok(state)) if state.phase == JobPhase::Cancelled => RunnerStatus::Cancelled,
                Ok(Ok(_)) => RunnerStatus::Succeeded,
                Ok(Err(e)) => {
                    tracing::error!(job_id = job_id.as_str(), execution_id = %execution_id, error = %e, "job execution failed");
                    RunnerStatus::Failed {
                        error: e.to_string(),
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = job_id.as_str(), execution_id = %execution_id, error = %e, "job task panicked");
                    RunnerStatus::Failed {
                        error: format!("job task panicked: {e}"),
                    }
                }
            };
            tracing::debug!(job_id = job_id.as_str(), execution_id = %execution_id, status = ?status, "execution exited");
            tx.send_replace(status);
        });

        Ok(execution)
    }

    async fn poll(&self, execution: &ExecutionRef) -> Result<RunnerStatus, RunnerError> {
        self.executions
            .get(&execution.id)
            .map(|e| e.status.borrow().clone())
            .ok_or(RunnerError::UnknownExecution(execution.id))
    }

    async fn cancel(&self, execution: &ExecutionRef) -> Result<bool, RunnerError> {
        let entry = self
            .executions
            .get(&execution.id)
            .ok_or(RunnerError::UnknownExecution(execution.id))?;
        if !entry.status.borrow().is_running() {
            return Ok(false);
        }
        entry.cancel_token.cancel();
        tracing::info!(
            job_id = entry.job_id.as_str(),
            execution_id = %execution.id,
            "cancellation requested"
        );
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
