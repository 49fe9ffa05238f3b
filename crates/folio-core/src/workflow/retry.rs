//! Retry policy for failed units.
//!
//! Stateless: the decision depends only on the unit's merged status and the
//! configured budget.

use folio_types::workflow::{UnitState, UnitStatus};

/// What to do with a unit after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the unit back on the pending queue.
    Requeue,
    /// Give up on the unit; it is left out of the artifact.
    Abandon,
}

/// Attempt budget per unit.
///
/// `retry_count` counts failed attempts. Every unit runs at least once; it is
/// abandoned after `max(max_retries, 1)` failures, so `max_retries = 0`
/// behaves like `1`: one attempt and no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn decide(&self, status: &UnitStatus) -> RetryDecision {
        if status.retry_count < self.max_retries {
            RetryDecision::Requeue
        } else {
            RetryDecision::Abandon
        }
    }

    /// Decision for a unit found neither completed, queued nor in flight.
    ///
    /// Only failures consume budget; a unit lost while pending or active is
    /// requeued as is.
    pub fn reconcile(&self, status: &UnitStatus) -> RetryDecision {
        match status.state {
            UnitState::Failed => self.decide(status),
            _ => RetryDecision::Requeue,
        }
    }
}
