//! Batch coordinator: drives one job from split to artifact.
//!
//! The coordinator is the only writer of a job's snapshot. Each cycle it
//! dispatches one wave of at most `concurrency` units, commits the dispatch,
//! runs the units concurrently via `tokio::JoinSet`, merges their outcomes
//! into the snapshot, applies the retry policy, and commits again. Wave N+1 is
//! never dispatched before wave N's merge is committed, so a crashed process
//! resumes by re-running the committed in-flight wave.
//!
//! Cancellation is cooperative and checked only at wave boundaries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use folio_types::config::EngineConfig;
use folio_types::error::RepositoryError;
use folio_types::event::JobEvent;
use folio_types::workflow::{JobPhase, StatusUpdate, WorkflowState};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::event::bus::EventBus;
use crate::repository::state_store::StateStore;

use super::executor::{UnitError, UnitExecutor, UnitOutcome};
use super::finalizer::{self, FinalizeError};
use super::merge::{MergeEffect, MergeError, apply_outcome, apply_update};
use super::retry::{RetryDecision, RetryPolicy};
use super::splitter::{self, Partitioner, SplitError};

// ---------------------------------------------------------------------------
// CoordinatorError
// ---------------------------------------------------------------------------

/// Errors that stop the coordinator.
///
/// Everything except `Finalization` aborts without committing, leaving the
/// last good snapshot in the store.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("state store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("merge invariant violated: {0}")]
    Merge(#[from] MergeError),

    #[error("split failed: {0}")]
    Split(#[from] SplitError),

    #[error("job '{job_id}' has an inconsistent snapshot: {reason}")]
    CorruptSnapshot { job_id: String, reason: String },

    #[error("job '{job_id}' exceeded its wave budget of {limit}")]
    WaveLimitExceeded { job_id: String, limit: u32 },

    #[error("finalization failed: {0}")]
    Finalization(#[from] FinalizeError),
}

// ---------------------------------------------------------------------------
// BatchCoordinator
// ---------------------------------------------------------------------------

/// Runs batch jobs against a snapshot store and a unit executor.
///
/// Generic over `S: StateStore` and `E: UnitExecutor` so tests can drive it
/// with the in-memory store and scripted executors.
pub struct BatchCoordinator<S, E> {
    store: Arc<S>,
    executor: Arc<E>,
    partitioner: Arc<dyn Partitioner>,
    config: EngineConfig,
    event_bus: EventBus,
}

impl<S, E> Clone for BatchCoordinator<S, E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            partitioner: Arc::clone(&self.partitioner),
            config: self.config.clone(),
            event_bus: self.event_bus.clone(),
        }
    }
}

impl<S: StateStore + 'static, E: UnitExecutor + 'static> BatchCoordinator<S, E> {
    /// Create a coordinator that partitions with `config.partition`.
    pub fn new(store: Arc<S>, executor: Arc<E>, config: EngineConfig, event_bus: EventBus) -> Self {
        let partitioner: Arc<dyn Partitioner> = Arc::new(config.partition.clone());
        Self {
            store,
            executor,
            partitioner,
            config,
            event_bus,
        }
    }

    /// Replace the configured partition strategy.
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Drive `job_id` until it is done, cancelled, or fails.
    ///
    /// Terminal snapshots are returned unchanged.
    pub async fn run(
        &self,
        job_id: &str,
        cancel_token: &CancellationToken,
    ) -> Result<WorkflowState, CoordinatorError> {
        let mut state = self
            .store
            .load(job_id)
            .await?
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))?;

        if state.phase.is_terminal() {
            tracing::debug!(job_id, phase = %state.phase, "job already terminal");
            return Ok(state);
        }

        let policy = RetryPolicy::new(self.config.max_retries);

        if state.phase == JobPhase::Splitting {
            self.split(&mut state)?;
            self.commit(&mut state).await?;
        } else {
            state.error = None;
            if !state.in_flight.is_empty() {
                tracing::info!(
                    job_id,
                    wave = state.wave,
                    units = state.in_flight.len(),
                    "resuming interrupted wave"
                );
                state.log(format!(
                    "resumed: re-running wave {} ({} units)",
                    state.wave,
                    state.in_flight.len()
                ));
            } else {
                tracing::info!(job_id, phase = %state.phase, "resuming job");
                state.log(format!("resumed in phase {}", state.phase));
            }
        }

        let budget = self.wave_budget(&state);

        loop {
            if cancel_token.is_cancelled() {
                return self.cancel(state).await;
            }

            if state.in_flight.is_empty() {
                if !state.pending.is_empty() {
                    self.dispatch_next(&mut state, budget)?;
                    self.commit(&mut state).await?;
                } else {
                    let missing = state.missing_ids();
                    if missing.is_empty() {
                        return self.finalize(state).await;
                    }
                    self.reconcile(&mut state, &policy, &missing);
                    self.commit(&mut state).await?;
                    continue;
                }
            }

            check_wave(&state)?;
            self.event_bus.publish(JobEvent::WaveDispatched {
                job_id: state.job_id.clone(),
                wave: state.wave,
                unit_ids: state.in_flight.clone(),
            });

            let outcomes = self.run_wave(&state).await;
            self.merge_wave(&mut state, &policy, outcomes)?;
            self.commit(&mut state).await?;
        }
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    fn split(&self, state: &mut WorkflowState) -> Result<(), CoordinatorError> {
        let plan = splitter::split(
            &state.all_inputs,
            self.partitioner.as_ref(),
            self.config.concurrency,
        )?;
        let total = plan.clusters.len();
        splitter::apply_plan(state, plan, Utc::now());

        let budget = self.wave_budget(state);
        if state.wave > budget {
            return Err(CoordinatorError::WaveLimitExceeded {
                job_id: state.job_id.clone(),
                limit: budget,
            });
        }

        state.phase = if state.in_flight.is_empty() {
            JobPhase::Finalizing
        } else {
            JobPhase::Waiting
        };
        state.log(format!(
            "split {} inputs into {total} units",
            state.all_inputs.len()
        ));
        tracing::info!(
            job_id = %state.job_id,
            inputs = state.all_inputs.len(),
            units = total,
            "job split"
        );
        self.event_bus.publish(JobEvent::JobStarted {
            job_id: state.job_id.clone(),
            total_units: total,
        });
        Ok(())
    }

    /// Move the next `concurrency` pending ids into flight.
    fn dispatch_next(&self, state: &mut WorkflowState, budget: u32) -> Result<(), CoordinatorError> {
        if state.wave >= budget {
            return Err(CoordinatorError::WaveLimitExceeded {
                job_id: state.job_id.clone(),
                limit: budget,
            });
        }

        let take = self.config.concurrency.max(1).min(state.pending.len());
        let wave: Vec<String> = state.pending.drain(..take).collect();
        let now = Utc::now();
        for id in &wave {
            apply_update(state, id, &StatusUpdate::active(now));
        }

        state.wave += 1;
        state.dispatched_count += wave.len() as u64;
        state.last_wave_size = wave.len();
        state.phase = JobPhase::Waiting;
        state.log(format!("wave {}: dispatched {}", state.wave, wave.join(", ")));
        tracing::debug!(
            job_id = %state.job_id,
            wave = state.wave,
            units = wave.len(),
            "dispatching wave"
        );
        state.in_flight = wave;
        Ok(())
    }

    /// Run every in-flight unit concurrently and collect their outcomes.
    async fn run_wave(&self, state: &WorkflowState) -> Vec<UnitOutcome> {
        let timeout_secs = self.config.unit_timeout_secs;
        let unit_timeout = Duration::from_secs(timeout_secs);
        let mut join_set = JoinSet::new();

        for item in state.in_flight.iter().filter_map(|id| state.cluster(id)) {
            let attempt = state.unit_status.get(&item.id).map_or(0, |s| s.retry_count);
            let item = item.clone();
            let executor = Arc::clone(&self.executor);

            join_set.spawn(async move {
                let started_at = Utc::now();
                let result = match tokio::time::timeout(unit_timeout, executor.run(&item)).await {
                    Ok(result) => result,
                    Err(_) => Err(UnitError::TimedOut(timeout_secs)),
                };
                UnitOutcome {
                    unit_id: item.id,
                    attempt,
                    result,
                    started_at,
                    ended_at: Utc::now(),
                }
            });
        }

        let mut outcomes = Vec::with_capacity(state.in_flight.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(job_id = %state.job_id, error = %e, "unit task panicked");
                }
            }
        }
        outcomes
    }

    /// Fold a wave's outcomes into the snapshot and apply the retry policy.
    fn merge_wave(
        &self,
        state: &mut WorkflowState,
        policy: &RetryPolicy,
        mut outcomes: Vec<UnitOutcome>,
    ) -> Result<(), CoordinatorError> {
        let now = Utc::now();
        for id in &state.in_flight {
            if !outcomes.iter().any(|o| &o.unit_id == id) {
                outcomes.push(UnitOutcome {
                    unit_id: id.clone(),
                    attempt: state.unit_status.get(id).map_or(0, |s| s.retry_count),
                    result: Err(UnitError::Failed("unit task aborted".to_string())),
                    started_at: now,
                    ended_at: now,
                });
            }
        }

        let mut failed: Vec<(String, String)> = Vec::new();
        for outcome in &outcomes {
            match apply_outcome(state, outcome)? {
                MergeEffect::Completed => {
                    state.log(format!("{} completed", outcome.unit_id));
                    self.event_bus.publish(JobEvent::UnitCompleted {
                        job_id: state.job_id.clone(),
                        unit_id: outcome.unit_id.clone(),
                        duration_ms: outcome.duration_ms(),
                    });
                }
                MergeEffect::Failed => {
                    let error = match &outcome.result {
                        Err(e) => e.to_string(),
                        Ok(_) => String::new(),
                    };
                    failed.push((outcome.unit_id.clone(), error));
                }
                MergeEffect::Duplicate => {
                    tracing::debug!(
                        job_id = %state.job_id,
                        unit_id = outcome.unit_id.as_str(),
                        "dropping duplicate outcome"
                    );
                }
            }
        }

        failed.sort_by_key(|(id, _)| cluster_position(state, id));
        let mut requeued = false;
        for (id, error) in failed {
            let Some(status) = state.unit_status.get(&id).cloned() else {
                continue;
            };
            match policy.decide(&status) {
                RetryDecision::Requeue => {
                    requeued = true;
                    apply_update(state, &id, &StatusUpdate::requeued());
                    state.pending.push(id.clone());
                    state.log(format!(
                        "{id} failed (attempt {}/{}): {error}; requeued",
                        status.retry_count, policy.max_retries
                    ));
                    tracing::warn!(
                        job_id = %state.job_id,
                        unit_id = id.as_str(),
                        retry_count = status.retry_count,
                        error = error.as_str(),
                        "unit failed, requeued"
                    );
                    self.event_bus.publish(JobEvent::UnitFailed {
                        job_id: state.job_id.clone(),
                        unit_id: id,
                        error,
                        will_retry: true,
                    });
                }
                RetryDecision::Abandon => {
                    self.abandon(state, &id, status.retry_count, Some(error));
                }
            }
        }

        state.in_flight.clear();
        state.phase = if requeued {
            JobPhase::Retrying
        } else if !state.pending.is_empty() {
            JobPhase::Dispatching
        } else {
            JobPhase::Finalizing
        };
        Ok(())
    }

    /// Handle ids that are neither resolved, queued nor in flight.
    fn reconcile(&self, state: &mut WorkflowState, policy: &RetryPolicy, missing: &[String]) {
        for id in missing {
            let status = state.unit_status.get(id).cloned().unwrap_or_default();
            match policy.reconcile(&status) {
                RetryDecision::Requeue => {
                    apply_update(state, id, &StatusUpdate::requeued());
                    state.pending.push(id.clone());
                    state.log(format!("{id} re-enqueued"));
                }
                RetryDecision::Abandon => {
                    self.abandon(state, id, status.retry_count, None);
                }
            }
        }
        state.phase = JobPhase::Retrying;
    }

    fn abandon(&self, state: &mut WorkflowState, id: &str, retry_count: u32, error: Option<String>) {
        state.abandoned_ids.insert(id.to_string());
        state.log(format!("{id} abandoned after {retry_count} failed attempts"));
        tracing::error!(
            job_id = %state.job_id,
            unit_id = id,
            retry_count,
            "unit abandoned"
        );
        if let Some(error) = error {
            self.event_bus.publish(JobEvent::UnitFailed {
                job_id: state.job_id.clone(),
                unit_id: id.to_string(),
                error,
                will_retry: false,
            });
        }
        self.event_bus.publish(JobEvent::UnitAbandoned {
            job_id: state.job_id.clone(),
            unit_id: id.to_string(),
            retry_count,
        });
    }

    async fn finalize(&self, mut state: WorkflowState) -> Result<WorkflowState, CoordinatorError> {
        state.phase = JobPhase::Finalizing;
        match finalizer::assemble(&state) {
            Ok(artifact) => {
                let complete = artifact.complete;
                state.final_artifact = Some(artifact);
                state.phase = JobPhase::Done;
                state.log(if complete {
                    "artifact assembled".to_string()
                } else {
                    format!(
                        "artifact assembled without {} abandoned units",
                        state.abandoned_ids.len()
                    )
                });
                self.commit(&mut state).await?;
                tracing::info!(
                    job_id = %state.job_id,
                    waves = state.wave,
                    abandoned = state.abandoned_ids.len(),
                    "job done"
                );
                self.publish_finished(&state);
                Ok(state)
            }
            Err(e) => {
                state.phase = JobPhase::Failed;
                state.error = Some(e.to_string());
                state.log(format!("finalization failed: {e}"));
                if let Err(store_err) = self.commit(&mut state).await {
                    tracing::warn!(
                        job_id = %state.job_id,
                        error = %store_err,
                        "could not persist finalization failure"
                    );
                }
                tracing::error!(job_id = %state.job_id, error = %e, "finalization failed");
                self.publish_finished(&state);
                Err(CoordinatorError::Finalization(e))
            }
        }
    }

    async fn cancel(&self, mut state: WorkflowState) -> Result<WorkflowState, CoordinatorError> {
        let returned = std::mem::take(&mut state.in_flight);
        for id in &returned {
            apply_update(&mut state, id, &StatusUpdate::requeued());
        }
        let pending = std::mem::take(&mut state.pending);
        state.pending = returned.into_iter().chain(pending).collect();
        state.phase = JobPhase::Cancelled;
        state.log(format!(
            "cancelled after wave {} with {} units pending",
            state.wave,
            state.pending.len()
        ));
        self.commit(&mut state).await?;
        tracing::info!(job_id = %state.job_id, wave = state.wave, "job cancelled");
        self.publish_finished(&state);
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn commit(&self, state: &mut WorkflowState) -> Result<(), CoordinatorError> {
        state.updated_at = Utc::now();
        self.store.save(&state.job_id, state).await?;
        Ok(())
    }

    /// `max_waves` from config, else one wave per possible attempt.
    fn wave_budget(&self, state: &WorkflowState) -> u32 {
        self.config.max_waves.unwrap_or_else(|| {
            let clusters = u32::try_from(state.all_clusters.len()).unwrap_or(u32::MAX);
            clusters.saturating_mul(self.config.max_retries.max(1))
        })
    }

    fn publish_finished(&self, state: &WorkflowState) {
        let progress = state.progress();
        self.event_bus.publish(JobEvent::JobFinished {
            job_id: state.job_id.clone(),
            phase: state.phase,
            completed: progress.completed,
            abandoned: progress.abandoned,
        });
    }
}

/// The committed wave must match its dispatch bookkeeping and name only
/// known work items.
fn check_wave(state: &WorkflowState) -> Result<(), CoordinatorError> {
    let corrupt = |reason: String| CoordinatorError::CorruptSnapshot {
        job_id: state.job_id.clone(),
        reason,
    };

    if state.in_flight.len() != state.last_wave_size
        || state.dispatched_count < state.in_flight.len() as u64
    {
        return Err(corrupt(format!(
            "wave {} has {} units in flight but recorded {} ({} dispatched in total)",
            state.wave,
            state.in_flight.len(),
            state.last_wave_size,
            state.dispatched_count
        )));
    }
    if let Some(id) = state.in_flight.iter().find(|id| state.cluster(id).is_none()) {
        return Err(corrupt(format!("in-flight unit '{id}' has no work item")));
    }
    Ok(())
}

fn cluster_position(state: &WorkflowState, id: &str) -> usize {
    state
        .all_clusters
        .iter()
        .position(|c| c.id == id)
        .unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
