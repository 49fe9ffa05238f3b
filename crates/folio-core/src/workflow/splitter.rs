//! Splitter: partitions raw inputs into work items and plans the first wave.
//!
//! Partition boundaries come from a `Partitioner`. `PartitionStrategy` (from
//! configuration) is the shipped implementation; callers can plug their own.
//! Whatever the partitioner returns is validated to cover every input exactly
//! once before any work item is created.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use folio_types::config::PartitionStrategy;
use folio_types::workflow::{StatusUpdate, UnitStatus, WorkItem, WorkItemMeta, WorkflowState};
use serde_json::Value;

use super::merge::apply_update;

/// Group key used by `group_by` for records that lack the field.
pub const UNGROUPED_KEY: &str = "ungrouped";

// ---------------------------------------------------------------------------
// Partitioner
// ---------------------------------------------------------------------------

/// One group of input positions produced by a partitioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputGroup {
    pub key: String,
    pub indices: Vec<usize>,
}

/// Decides cluster boundaries over the ordered input records.
///
/// Must be total: every index in `0..inputs.len()` appears in exactly one
/// group, and no group is empty.
pub trait Partitioner: Send + Sync {
    fn partition(&self, inputs: &[Value]) -> Vec<InputGroup>;
}

impl Partitioner for PartitionStrategy {
    fn partition(&self, inputs: &[Value]) -> Vec<InputGroup> {
        match self {
            PartitionStrategy::Chunk { size } => chunk(inputs.len(), *size),
            PartitionStrategy::GroupBy {
                field,
                max_group_size,
            } => group_by(inputs, field, *max_group_size),
        }
    }
}

fn chunk(len: usize, size: usize) -> Vec<InputGroup> {
    let size = size.max(1);
    (0..len)
        .step_by(size)
        .enumerate()
        .map(|(n, start)| InputGroup {
            key: format!("chunk-{}", n + 1),
            indices: (start..(start + size).min(len)).collect(),
        })
        .collect()
}

fn group_by(inputs: &[Value], field: &str, max_group_size: Option<usize>) -> Vec<InputGroup> {
    let mut groups: Vec<InputGroup> = Vec::new();
    for (idx, record) in inputs.iter().enumerate() {
        let key = match record.get(field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => UNGROUPED_KEY.to_string(),
            Some(other) => other.to_string(),
        };
        match groups.iter_mut().find(|g| g.key == key) {
            Some(group) => group.indices.push(idx),
            None => groups.push(InputGroup {
                key,
                indices: vec![idx],
            }),
        }
    }

    let Some(limit) = max_group_size.filter(|n| *n > 0) else {
        return groups;
    };
    groups
        .into_iter()
        .flat_map(|group| {
            let key = group.key;
            group
                .indices
                .chunks(limit)
                .map(|part| InputGroup {
                    key: key.clone(),
                    indices: part.to_vec(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// SplitPlan
// ---------------------------------------------------------------------------

/// The static partition of a job plus its first dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPlan {
    pub clusters: Vec<WorkItem>,
    pub requested_ids: BTreeSet<String>,
    /// The first `min(W, clusters)` ids, dispatched immediately.
    pub first_wave: Vec<String>,
    /// Remaining ids in cluster order.
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("invalid partition: {0}")]
    InvalidPartition(String),
}

/// Deterministic work item id for the cluster at position `n` (0-based).
pub fn unit_id(n: usize) -> String {
    format!("unit-{:04}", n + 1)
}

/// Partition `inputs` and plan the first wave of at most `wave_size` units.
pub fn split(
    inputs: &[Value],
    partitioner: &dyn Partitioner,
    wave_size: usize,
) -> Result<SplitPlan, SplitError> {
    if wave_size == 0 {
        return Err(SplitError::ZeroConcurrency);
    }

    let groups = partitioner.partition(inputs);
    validate(&groups, inputs.len())?;

    let clusters: Vec<WorkItem> = groups
        .into_iter()
        .enumerate()
        .map(|(n, group)| WorkItem {
            id: unit_id(n),
            payload: Value::Array(group.indices.iter().map(|&i| inputs[i].clone()).collect()),
            meta: WorkItemMeta {
                group_key: group.key,
                input_indices: group.indices,
            },
        })
        .collect();

    let mut ids: Vec<String> = clusters.iter().map(|c| c.id.clone()).collect();
    let requested_ids = ids.iter().cloned().collect();
    let pending = ids.split_off(wave_size.min(ids.len()));

    Ok(SplitPlan {
        clusters,
        requested_ids,
        first_wave: ids,
        pending,
    })
}

fn validate(groups: &[InputGroup], len: usize) -> Result<(), SplitError> {
    let mut seen = vec![false; len];
    for group in groups {
        if group.indices.is_empty() {
            return Err(SplitError::InvalidPartition(format!(
                "group '{}' is empty",
                group.key
            )));
        }
        for &idx in &group.indices {
            match seen.get_mut(idx) {
                None => {
                    return Err(SplitError::InvalidPartition(format!(
                        "index {idx} out of range for {len} inputs"
                    )));
                }
                Some(true) => {
                    return Err(SplitError::InvalidPartition(format!(
                        "index {idx} assigned twice"
                    )));
                }
                Some(slot) => *slot = true,
            }
        }
    }
    if let Some(idx) = seen.iter().position(|s| !s) {
        return Err(SplitError::InvalidPartition(format!(
            "index {idx} not assigned to any group"
        )));
    }
    Ok(())
}

/// Write the plan into a freshly created snapshot.
///
/// Every id starts `pending`; the first wave is then flipped to `active` and
/// becomes the in-flight wave 1.
pub fn apply_plan(state: &mut WorkflowState, plan: SplitPlan, at: DateTime<Utc>) {
    state.unit_status = plan
        .requested_ids
        .iter()
        .map(|id| (id.clone(), UnitStatus::pending()))
        .collect();
    for id in &plan.first_wave {
        apply_update(state, id, &StatusUpdate::active(at));
    }

    state.all_clusters = plan.clusters;
    state.requested_ids = plan.requested_ids;
    state.pending = plan.pending;
    state.last_wave_size = plan.first_wave.len();
    state.dispatched_count = plan.first_wave.len() as u64;
    state.wave = u32::from(!plan.first_wave.is_empty());
    state.in_flight = plan.first_wave;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use folio_types::workflow::UnitState;
    use serde_json::json;

    fn assert_exact_partition(plan: &SplitPlan, len: usize) {
        let mut covered: Vec<usize> = plan
            .clusters
            .iter()
            .flat_map(|c| c.meta.input_indices.iter().copied())
            .collect();
        covered.sort_unstable();
        assert_eq!(covered, (0..len).collect::<Vec<_>>());
    }

    fn topics(list: &[&str]) -> Vec<Value> {
        list.iter()
            .enumerate()
            .map(|(i, t)| json!({"topic": t, "n": i}))
            .collect()
    }

    #[test]
    fn test_chunk_partition_is_exact() {
        for len in 0..12 {
            for size in 1..5 {
                let inputs: Vec<Value> = (0..len).map(|i| json!(i)).collect();
                let plan = split(&inputs, &PartitionStrategy::Chunk { size }, 3).unwrap();
                assert_exact_partition(&plan, len);
                assert_eq!(plan.clusters.len(), len.div_ceil(size));
            }
        }
    }

    #[test]
    fn test_group_by_partition_is_exact() {
        let inputs = topics(&["a", "b", "a", "c", "b", "a"]);
        let strategy = PartitionStrategy::GroupBy {
            field: "topic".to_string(),
            max_group_size: None,
        };
        let plan = split(&inputs, &strategy, 2).unwrap();

        assert_exact_partition(&plan, inputs.len());
        let keys: Vec<&str> = plan.clusters.iter().map(|c| c.meta.group_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(plan.clusters[0].meta.input_indices, vec![0, 2, 5]);
    }

    #[test]
    fn test_group_by_missing_field_goes_to_ungrouped() {
        let inputs = vec![json!({"topic": "x"}), json!({"other": 1}), json!("bare")];
        let strategy = PartitionStrategy::GroupBy {
            field: "topic".to_string(),
            max_group_size: None,
        };
        let plan = split(&inputs, &strategy, 4).unwrap();

        assert_eq!(plan.clusters.len(), 2);
        assert_eq!(plan.clusters[1].meta.group_key, UNGROUPED_KEY);
        assert_eq!(plan.clusters[1].meta.input_indices, vec![1, 2]);
    }

    #[test]
    fn test_group_by_splits_oversize_groups() {
        let inputs = topics(&["a", "a", "a", "a", "a", "b"]);
        let strategy = PartitionStrategy::GroupBy {
            field: "topic".to_string(),
            max_group_size: Some(2),
        };
        let plan = split(&inputs, &strategy, 10).unwrap();

        assert_exact_partition(&plan, inputs.len());
        let sizes: Vec<usize> = plan
            .clusters
            .iter()
            .map(|c| c.meta.input_indices.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1, 1]);
    }

    #[test]
    fn test_non_string_keys_use_json_form() {
        let inputs = vec![json!({"k": 1}), json!({"k": 2}), json!({"k": 1})];
        let strategy = PartitionStrategy::GroupBy {
            field: "k".to_string(),
            max_group_size: None,
        };
        let plan = split(&inputs, &strategy, 1).unwrap();
        assert_eq!(plan.clusters[0].meta.group_key, "1");
        assert_eq!(plan.clusters[0].payload, json!([{"k": 1}, {"k": 1}]));
    }

    #[test]
    fn test_first_wave_and_pending() {
        let inputs: Vec<Value> = (0..5).map(|i| json!(i)).collect();
        let plan = split(&inputs, &PartitionStrategy::default(), 2).unwrap();

        assert_eq!(plan.first_wave, vec!["unit-0001", "unit-0002"]);
        assert_eq!(plan.pending, vec!["unit-0003", "unit-0004", "unit-0005"]);
        assert_eq!(plan.requested_ids.len(), 5);
    }

    #[test]
    fn test_wave_larger_than_clusters() {
        let inputs = vec![json!("only")];
        let plan = split(&inputs, &PartitionStrategy::default(), 8).unwrap();
        assert_eq!(plan.first_wave, vec!["unit-0001"]);
        assert!(plan.pending.is_empty());
    }

    #[test]
    fn test_empty_input_yields_empty_plan() {
        let plan = split(&[], &PartitionStrategy::default(), 4).unwrap();
        assert!(plan.clusters.is_empty());
        assert!(plan.first_wave.is_empty());
        assert!(plan.requested_ids.is_empty());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = split(&[json!(1)], &PartitionStrategy::default(), 0).unwrap_err();
        assert_eq!(err, SplitError::ZeroConcurrency);
    }

    struct Overlapping;

    impl Partitioner for Overlapping {
        fn partition(&self, inputs: &[Value]) -> Vec<InputGroup> {
            vec![
                InputGroup {
                    key: "all".into(),
                    indices: (0..inputs.len()).collect(),
                },
                InputGroup {
                    key: "first".into(),
                    indices: vec![0],
                },
            ]
        }
    }

    #[test]
    fn test_overlapping_partition_rejected() {
        let err = split(&[json!(1), json!(2)], &Overlapping, 1).unwrap_err();
        assert!(matches!(err, SplitError::InvalidPartition(msg) if msg.contains("twice")));
    }

    #[test]
    fn test_apply_plan_initialises_status() {
        let inputs: Vec<Value> = (0..3).map(|i| json!(i)).collect();
        let mut state = WorkflowState::new("job-1", inputs.clone());
        let plan = split(&inputs, &PartitionStrategy::default(), 2).unwrap();
        let now = Utc::now();

        apply_plan(&mut state, plan, now);

        assert_eq!(state.all_clusters.len(), 3);
        assert_eq!(state.in_flight, vec!["unit-0001", "unit-0002"]);
        assert_eq!(state.pending, vec!["unit-0003"]);
        assert_eq!(state.wave, 1);
        assert_eq!(state.dispatched_count, 2);
        assert_eq!(state.unit_status["unit-0001"].state, UnitState::Active);
        assert_eq!(state.unit_status["unit-0001"].started_at, Some(now));
        assert_eq!(state.unit_status["unit-0003"].state, UnitState::Pending);
    }
}
