//! Unit-of-work executor port.
//!
//! An executor turns one `WorkItem` into an output (in production, an LLM
//! call over one cluster of inputs). It never touches workflow state: the
//! coordinator wraps every run into a `UnitOutcome` and merges it. Retries
//! re-run the identical work item, so implementations must be safely
//! re-invocable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use folio_types::workflow::WorkItem;
use serde_json::Value;

// ---------------------------------------------------------------------------
// UnitExecutor trait
// ---------------------------------------------------------------------------

/// Runs a single work item.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait UnitExecutor: Send + Sync {
    fn run(
        &self,
        item: &WorkItem,
    ) -> impl std::future::Future<Output = Result<Value, UnitError>> + Send;
}

// ---------------------------------------------------------------------------
// UnitError
// ---------------------------------------------------------------------------

/// Typed failure of one unit attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    /// Transport-level hiccup worth retrying inside the executor.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Terminal failure of this attempt.
    #[error("unit failed: {0}")]
    Failed(String),

    /// The attempt exceeded the per-unit timeout.
    #[error("unit timed out after {0}s")]
    TimedOut(u64),
}

impl UnitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UnitError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// UnitOutcome
// ---------------------------------------------------------------------------

/// What one dispatched attempt reported back to the coordinator.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit_id: String,
    /// The unit's `retry_count` at dispatch time.
    pub attempt: u32,
    pub result: Result<Value, UnitError>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl UnitOutcome {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// RetryingExecutor
// ---------------------------------------------------------------------------

/// Retries `UnitError::Transient` failures of an inner executor with
/// exponential backoff before surfacing a terminal failure.
///
/// Non-transient errors are returned immediately. When the transient budget
/// runs out the last error is converted to `UnitError::Failed` so the
/// coordinator counts it against the unit's retry budget.
#[derive(Debug, Clone)]
pub struct RetryingExecutor<E> {
    inner: E,
    max_transient_retries: u32,
    base_delay: Duration,
}

impl<E: UnitExecutor> RetryingExecutor<E> {
    pub fn new(inner: E, max_transient_retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_transient_retries,
            base_delay,
        }
    }

    /// Delay before transient retry number `retry` (0-based).
    fn backoff(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

impl<E: UnitExecutor> UnitExecutor for RetryingExecutor<E> {
    async fn run(&self, item: &WorkItem) -> Result<Value, UnitError> {
        let mut retry = 0;
        loop {
            match self.inner.run(item).await {
                Err(UnitError::Transient(msg)) if retry < self.max_transient_retries => {
                    let delay = self.backoff(retry);
                    tracing::debug!(
                        unit_id = item.id.as_str(),
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = msg.as_str(),
                        "transient unit failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(UnitError::Transient(msg)) => {
                    return Err(UnitError::Failed(format!(
                        "gave up after {} transient retries: {msg}",
                        self.max_transient_retries
                    )));
                }
                other => return other,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
