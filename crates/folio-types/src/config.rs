//! Configuration types for Folio.
//!
//! `GlobalConfig` represents the top-level `config.toml` in the data
//! directory. `EngineConfig` carries the knobs the batch coordinator needs;
//! `ExecutorConfig` describes the process-backed unit executor. All fields
//! have documented defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for Folio.
///
/// Loaded from `~/.folio/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Process executor settings. `None` when no executor is configured.
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
}

/// Batch coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum units per wave (`W`).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts per unit before it is abandoned (`MAX_RETRIES`).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-unit timeout; a timeout counts as a failed attempt.
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,

    /// Upper bound on waves per job. `None` derives
    /// `clusters × max(max_retries, 1)` at split time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waves: Option<u32>,

    /// Log entries returned by status queries.
    #[serde(default = "default_recent_log_limit")]
    pub recent_log_limit: usize,

    #[serde(default)]
    pub partition: PartitionStrategy,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_unit_timeout_secs() -> u64 {
    300
}

fn default_recent_log_limit() -> usize {
    20
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            unit_timeout_secs: default_unit_timeout_secs(),
            max_waves: None,
            recent_log_limit: default_recent_log_limit(),
            partition: PartitionStrategy::default(),
        }
    }
}

/// How inputs are grouped into work items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Contiguous runs of `size` records.
    Chunk {
        #[serde(default = "default_chunk_size")]
        size: usize,
    },
    /// Group by the string value of a JSON field, in first-appearance order.
    GroupBy {
        field: String,
        /// Split groups larger than this into consecutive chunks.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_group_size: Option<usize>,
    },
}

fn default_chunk_size() -> usize {
    1
}

impl Default for PartitionStrategy {
    fn default() -> Self {
        PartitionStrategy::Chunk {
            size: default_chunk_size(),
        }
    }
}

/// Settings for the process-per-unit executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Program spawned once per unit. Receives the work item JSON on stdin.
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// In-executor retries for transient failures (spawn/IO errors).
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,

    /// Base delay for the exponential backoff between transient retries.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl ExecutorConfig {
    /// `program args..` with default retry settings.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            transient_retries: default_transient_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_transient_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.unit_timeout_secs, 300);
        assert!(config.max_waves.is_none());
        assert_eq!(config.partition, PartitionStrategy::Chunk { size: 1 });
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.executor.is_none());
    }

    #[test]
    fn test_group_by_partition_from_toml() {
        let toml_str = r#"
[engine]
concurrency = 8
max_retries = 5

[engine.partition]
strategy = "group_by"
field = "topic"
max_group_size = 10

[executor]
program = "section-writer"
args = ["--model", "large"]
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.concurrency, 8);
        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(
            config.engine.partition,
            PartitionStrategy::GroupBy {
                field: "topic".to_string(),
                max_group_size: Some(10),
            }
        );
        let executor = config.executor.unwrap();
        assert_eq!(executor.program, "section-writer");
        assert_eq!(executor.args, vec!["--model", "large"]);
        assert_eq!(executor.transient_retries, 2);
        assert_eq!(executor.backoff_ms, 500);
    }

    #[test]
    fn test_executor_config_new_uses_default_retries() {
        let config = ExecutorConfig::new("cat", vec![]);
        assert_eq!(config.program, "cat");
        assert_eq!(config.transient_retries, 2);
        assert_eq!(config.backoff_ms, 500);
    }

    #[test]
    fn test_chunk_size_defaults_to_one() {
        let toml_str = r#"
[engine.partition]
strategy = "chunk"
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.partition, PartitionStrategy::Chunk { size: 1 });
    }
}
