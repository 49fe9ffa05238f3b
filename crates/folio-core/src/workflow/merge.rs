//! Merge semantics for the workflow snapshot.
//!
//! Every write to `WorkflowState` produced by unit executions goes through
//! this module. The functions are pure over `(old, new)` pairs so they can be
//! tested in isolation from the coordinator:
//!
//! - `merge_unit_status` -- per-key merge of a `StatusUpdate` into a
//!   `UnitStatus`. `Completed` is sticky, non-status fields are last-writer
//!   wins, and `retry_count` follows the failure-increment rule.
//! - `merge_results` -- key union of result maps, incoming wins.
//! - `apply_outcome` -- folds one `UnitOutcome` into the snapshot.

use std::collections::BTreeMap;

use folio_types::workflow::{
    PartialResult, StatusUpdate, UnitState, UnitStatus, WorkflowState,
};
use serde_json::Value;

use super::executor::UnitOutcome;

// ---------------------------------------------------------------------------
// Unit status merge
// ---------------------------------------------------------------------------

/// Merge `update` into the current status of one unit.
///
/// Retry counting (one merge call raises the count by at most one unless an
/// explicit count is supplied):
/// - an explicit `update.retry_count` raises the count to at least that value;
/// - a `Failed` update carrying `attempt = a` increments the count by one when
///   `a` is not behind it, so the failure of the attempt dispatched at count
///   `k` lands on exactly `k + 1` and a duplicate delivery of it (now behind)
///   changes nothing;
/// - a `Failed` update without an attempt increments by one only when the
///   unit was not already `Failed`.
///
/// The count never decreases.
pub fn merge_unit_status(old: Option<&UnitStatus>, update: &StatusUpdate) -> UnitStatus {
    let base = old.cloned().unwrap_or_default();

    if base.state == UnitState::Completed {
        return base;
    }

    let mut retry_count = base.retry_count;
    if let Some(explicit) = update.retry_count {
        retry_count = retry_count.max(explicit);
    } else if update.state == UnitState::Failed {
        retry_count = match update.attempt {
            Some(attempt) if attempt >= retry_count => retry_count.saturating_add(1),
            Some(_) => retry_count,
            None if base.state != UnitState::Failed => retry_count.saturating_add(1),
            None => retry_count,
        };
    }

    let (ended_at, error) = match update.state {
        UnitState::Active => (None, update.error.clone().or(base.error)),
        UnitState::Completed => (update.ended_at.or(base.ended_at), None),
        UnitState::Pending | UnitState::Failed => (
            update.ended_at.or(base.ended_at),
            update.error.clone().or(base.error),
        ),
    };

    UnitStatus {
        state: update.state,
        started_at: update.started_at.or(base.started_at),
        ended_at,
        error,
        retry_count,
    }
}

/// Apply `update` to the status entry for `unit_id` in place.
pub fn apply_update(state: &mut WorkflowState, unit_id: &str, update: &StatusUpdate) {
    let merged = merge_unit_status(state.unit_status.get(unit_id), update);
    state.unit_status.insert(unit_id.to_string(), merged);
}

// ---------------------------------------------------------------------------
// Results merge
// ---------------------------------------------------------------------------

/// Key union of two result maps; entries in `incoming` overwrite `current`.
pub fn merge_results(
    mut current: BTreeMap<String, Value>,
    incoming: BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    current.extend(incoming);
    current
}

// ---------------------------------------------------------------------------
// Outcome merge
// ---------------------------------------------------------------------------

/// What merging one outcome did to the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEffect {
    /// First successful result for the unit.
    Completed,
    /// The attempt failed; the unit is now `Failed`.
    Failed,
    /// The unit already had a result; nothing changed.
    Duplicate,
}

/// Errors that indicate a broken merge invariant. These are fatal to the job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// An outcome arrived for an id the splitter never produced.
    #[error("outcome for unknown unit '{0}'")]
    UnknownUnit(String),
}

/// Fold one unit outcome into the snapshot.
///
/// A success for a unit already present in `results_by_id` is a no-op, which
/// makes re-merging a redelivered completion idempotent. A failure reported
/// after the unit completed is dropped.
pub fn apply_outcome(
    state: &mut WorkflowState,
    outcome: &UnitOutcome,
) -> Result<MergeEffect, MergeError> {
    let id = outcome.unit_id.as_str();
    if !state.requested_ids.contains(id) {
        return Err(MergeError::UnknownUnit(id.to_string()));
    }

    match &outcome.result {
        Ok(output) => {
            if state.results_by_id.contains_key(id) {
                return Ok(MergeEffect::Duplicate);
            }
            apply_update(
                state,
                id,
                &StatusUpdate::completed(outcome.attempt, outcome.ended_at),
            );
            let results = std::mem::take(&mut state.results_by_id);
            state.results_by_id =
                merge_results(results, BTreeMap::from([(id.to_string(), output.clone())]));
            state.partial_results.push(PartialResult {
                unit_id: id.to_string(),
                output: output.clone(),
            });
            Ok(MergeEffect::Completed)
        }
        Err(err) => {
            if state.is_completed(id) {
                return Ok(MergeEffect::Duplicate);
            }
            apply_update(
                state,
                id,
                &StatusUpdate::failed(outcome.attempt, err.to_string(), outcome.ended_at),
            );
            Ok(MergeEffect::Failed)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::executor::UnitError;
    use chrono::Utc;
    use serde_json::json;

    fn failed_status(retry_count: u32) -> UnitStatus {
        UnitStatus {
            state: UnitState::Failed,
            started_at: Some(Utc::now()),
            ended_at: Some(Utc::now()),
            error: Some("boom".to_string()),
            retry_count,
        }
    }

    fn state_with(ids: &[&str]) -> WorkflowState {
        let mut state = WorkflowState::new("job-1", vec![]);
        for id in ids {
            state.requested_ids.insert(id.to_string());
            state.unit_status.insert(id.to_string(), UnitStatus::pending());
        }
        state
    }

    fn outcome(id: &str, attempt: u32, result: Result<Value, UnitError>) -> UnitOutcome {
        let now = Utc::now();
        UnitOutcome {
            unit_id: id.to_string(),
            attempt,
            result,
            started_at: now,
            ended_at: now,
        }
    }

    // -------------------------------------------------------------------
    // merge_unit_status
    // -------------------------------------------------------------------

    #[test]
    fn test_first_failure_sets_count_to_one() {
        let merged = merge_unit_status(None, &StatusUpdate::failed(0, "err", Utc::now()));
        assert_eq!(merged.state, UnitState::Failed);
        assert_eq!(merged.retry_count, 1);
        assert_eq!(merged.error.as_deref(), Some("err"));
    }

    #[test]
    fn test_failed_to_failed_increments_exactly_once() {
        for k in 0..10 {
            let old = failed_status(k);
            let merged =
                merge_unit_status(Some(&old), &StatusUpdate::failed(k, "again", Utc::now()));
            assert_eq!(merged.retry_count, k + 1, "pre-merge count {k}");
        }
    }

    #[test]
    fn test_attempt_ahead_of_count_increments_by_one() {
        let merged = merge_unit_status(
            Some(&failed_status(1)),
            &StatusUpdate::failed(5, "again", Utc::now()),
        );
        assert_eq!(merged.retry_count, 2);

        let fresh = merge_unit_status(None, &StatusUpdate::failed(3, "first", Utc::now()));
        assert_eq!(fresh.retry_count, 1);
    }

    #[test]
    fn test_stale_attempt_does_not_increment() {
        let merged = merge_unit_status(
            Some(&failed_status(4)),
            &StatusUpdate::failed(2, "old attempt", Utc::now()),
        );
        assert_eq!(merged.retry_count, 4);
    }

    #[test]
    fn test_duplicate_failure_delivery_does_not_increment() {
        let update = StatusUpdate::failed(2, "err", Utc::now());
        let once = merge_unit_status(Some(&failed_status(2)), &update);
        let twice = merge_unit_status(Some(&once), &update);
        assert_eq!(once.retry_count, 3);
        assert_eq!(twice.retry_count, 3);
    }

    #[test]
    fn test_failed_without_attempt_increments_only_on_transition() {
        let update = StatusUpdate {
            attempt: None,
            ..StatusUpdate::failed(0, "err", Utc::now())
        };

        let active = UnitStatus {
            state: UnitState::Active,
            retry_count: 1,
            ..UnitStatus::pending()
        };
        assert_eq!(merge_unit_status(Some(&active), &update).retry_count, 2);
        assert_eq!(merge_unit_status(Some(&failed_status(2)), &update).retry_count, 2);
    }

    #[test]
    fn test_explicit_retry_count_never_decreases() {
        let update = StatusUpdate {
            retry_count: Some(1),
            ..StatusUpdate::failed(0, "err", Utc::now())
        };
        assert_eq!(merge_unit_status(Some(&failed_status(4)), &update).retry_count, 4);

        let raise = StatusUpdate {
            retry_count: Some(7),
            ..StatusUpdate::requeued()
        };
        assert_eq!(merge_unit_status(Some(&failed_status(4)), &raise).retry_count, 7);
    }

    #[test]
    fn test_failure_delivery_order_does_not_change_count() {
        let redispatched = UnitStatus {
            state: UnitState::Active,
            retry_count: 1,
            ..UnitStatus::pending()
        };
        let a = StatusUpdate::failed(1, "first", Utc::now());
        let b = StatusUpdate::failed(1, "second", Utc::now());

        let ab = merge_unit_status(Some(&merge_unit_status(Some(&redispatched), &a)), &b);
        let ba = merge_unit_status(Some(&merge_unit_status(Some(&redispatched), &b)), &a);
        assert_eq!(ab.retry_count, 2);
        assert_eq!(ba.retry_count, 2);
    }

    #[test]
    fn test_completed_is_sticky() {
        let done = merge_unit_status(None, &StatusUpdate::completed(0, Utc::now()));
        let after = merge_unit_status(Some(&done), &StatusUpdate::failed(0, "late", Utc::now()));
        assert_eq!(after, done);
        assert_eq!(after.retry_count, 0);
    }

    #[test]
    fn test_redispatch_keeps_count_and_clears_end_time() {
        let old = failed_status(2);
        let now = Utc::now();
        let merged = merge_unit_status(Some(&old), &StatusUpdate::active(now));
        assert_eq!(merged.state, UnitState::Active);
        assert_eq!(merged.retry_count, 2);
        assert_eq!(merged.started_at, Some(now));
        assert!(merged.ended_at.is_none());
    }

    #[test]
    fn test_completion_clears_error() {
        let merged =
            merge_unit_status(Some(&failed_status(1)), &StatusUpdate::completed(1, Utc::now()));
        assert_eq!(merged.state, UnitState::Completed);
        assert!(merged.error.is_none());
        assert_eq!(merged.retry_count, 1);
    }

    // -------------------------------------------------------------------
    // merge_results
    // -------------------------------------------------------------------

    #[test]
    fn test_merge_results_union_incoming_wins() {
        let current = BTreeMap::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]);
        let incoming = BTreeMap::from([
            ("b".to_string(), json!(20)),
            ("c".to_string(), json!(3)),
        ]);
        let merged = merge_results(current, incoming);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["b"], json!(20));
        assert_eq!(merged["c"], json!(3));
    }

    #[test]
    fn test_merge_results_idempotent() {
        let incoming = BTreeMap::from([("a".to_string(), json!("text"))]);
        let once = merge_results(BTreeMap::new(), incoming.clone());
        let twice = merge_results(once.clone(), incoming);
        assert_eq!(once, twice);
    }

    // -------------------------------------------------------------------
    // apply_outcome
    // -------------------------------------------------------------------

    #[test]
    fn test_apply_success_records_result() {
        let mut state = state_with(&["unit-0001"]);
        let effect = apply_outcome(&mut state, &outcome("unit-0001", 0, Ok(json!("s1")))).unwrap();

        assert_eq!(effect, MergeEffect::Completed);
        assert!(state.is_completed("unit-0001"));
        assert_eq!(state.results_by_id["unit-0001"], json!("s1"));
        assert_eq!(state.partial_results.len(), 1);
    }

    #[test]
    fn test_apply_success_keeps_other_results() {
        let mut state = state_with(&["unit-0001", "unit-0002"]);
        apply_outcome(&mut state, &outcome("unit-0001", 0, Ok(json!("s1")))).unwrap();
        apply_outcome(&mut state, &outcome("unit-0002", 1, Ok(json!("s2")))).unwrap();

        assert_eq!(state.results_by_id.len(), 2);
        assert_eq!(state.results_by_id["unit-0001"], json!("s1"));
        assert_eq!(state.results_by_id["unit-0002"], json!("s2"));
    }

    #[test]
    fn test_duplicate_completion_is_noop() {
        let mut state = state_with(&["unit-0001"]);
        let first = outcome("unit-0001", 0, Ok(json!("s1")));
        apply_outcome(&mut state, &first).unwrap();
        let snapshot = state.clone();

        let effect = apply_outcome(&mut state, &first).unwrap();
        assert_eq!(effect, MergeEffect::Duplicate);
        assert_eq!(state, snapshot);
    }

    #[test]
    fn test_late_failure_after_success_is_dropped() {
        let mut state = state_with(&["unit-0001"]);
        apply_outcome(&mut state, &outcome("unit-0001", 0, Ok(json!("s1")))).unwrap();

        let effect = apply_outcome(
            &mut state,
            &outcome("unit-0001", 0, Err(UnitError::Failed("late".into()))),
        )
        .unwrap();
        assert_eq!(effect, MergeEffect::Duplicate);
        assert!(state.is_completed("unit-0001"));
        assert_eq!(state.unit_status["unit-0001"].retry_count, 0);
    }

    #[test]
    fn test_apply_failure_increments_count() {
        let mut state = state_with(&["unit-0001"]);
        let effect = apply_outcome(
            &mut state,
            &outcome("unit-0001", 0, Err(UnitError::TimedOut(30))),
        )
        .unwrap();

        assert_eq!(effect, MergeEffect::Failed);
        let status = &state.unit_status["unit-0001"];
        assert_eq!(status.state, UnitState::Failed);
        assert_eq!(status.retry_count, 1);
        assert!(status.error.as_deref().unwrap().contains("timed out"));
        assert!(state.results_by_id.is_empty());
    }

    #[test]
    fn test_unknown_unit_is_invariant_violation() {
        let mut state = state_with(&["unit-0001"]);
        let err = apply_outcome(&mut state, &outcome("unit-9999", 0, Ok(json!(null)))).unwrap_err();
        assert_eq!(err, MergeError::UnknownUnit("unit-9999".to_string()));
    }
}
