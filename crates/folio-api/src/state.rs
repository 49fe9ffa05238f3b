//! Application state wiring the engine to the concrete infrastructure.
//!
//! The engine is generic over its store, executor, and runner; AppState pins
//! those generics to SQLite, the process executor, and the in-process runner.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use folio_core::event::EventBus;
use folio_core::workflow::controller::ExecutionController;
use folio_core::workflow::coordinator::BatchCoordinator;
use folio_core::workflow::executor::RetryingExecutor;
use folio_core::workflow::runner::LocalJobRunner;
use folio_infra::config::{CONFIG_FILE, load_global_config};
use folio_infra::executor::CommandExecutor;
use folio_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use folio_infra::sqlite::pool::{DatabasePool, database_url};
use folio_infra::sqlite::state_store::SqliteStateStore;
use folio_types::config::{ExecutorConfig, GlobalConfig};

/// Concrete type aliases for the engine generics pinned to infra implementations.
pub type ConcreteExecutor = RetryingExecutor<CommandExecutor>;

pub type ConcreteRunner = LocalJobRunner<SqliteStateStore, ConcreteExecutor>;

pub type ConcreteController = ExecutionController<SqliteStateStore, ConcreteRunner>;

/// Shared state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStateStore>,
    pub config: GlobalConfig,
    pub event_bus: EventBus,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load config, open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self {
            store: Arc::new(SqliteStateStore::new(db_pool)),
            config,
            event_bus: EventBus::default(),
            data_dir,
        })
    }

    /// Build a controller whose units run `command`, or the configured
    /// executor when `command` is empty.
    pub fn controller(&self, command: &[String]) -> anyhow::Result<ConcreteController> {
        let executor_config = resolve_executor(self.config.executor.as_ref(), command)
            .with_context(|| {
                format!(
                    "no executor configured: add an [executor] section to {} or pass a command after `--`",
                    self.data_dir.join(CONFIG_FILE).display()
                )
            })?;
        tracing::debug!(program = executor_config.program.as_str(), "using unit executor");

        let coordinator = BatchCoordinator::new(
            Arc::clone(&self.store),
            Arc::new(CommandExecutor::from_config(&executor_config)),
            self.config.engine.clone(),
            self.event_bus.clone(),
        );
        let runner = LocalJobRunner::new(coordinator);
        Ok(ExecutionController::new(
            Arc::clone(&self.store),
            Arc::new(runner),
            self.config.engine.recent_log_limit,
        ))
    }
}

/// A command line wins over the configured program; it keeps the configured
/// retry settings when there are any.
fn resolve_executor(
    configured: Option<&ExecutorConfig>,
    command: &[String],
) -> Option<ExecutorConfig> {
    match (command.split_first(), configured) {
        (Some((program, args)), Some(configured)) => Some(ExecutorConfig {
            program: program.clone(),
            args: args.to_vec(),
            ..configured.clone()
        }),
        (Some((program, args)), None) => Some(ExecutorConfig::new(program.clone(), args.to_vec())),
        (None, configured) => configured.cloned(),
    }
}
