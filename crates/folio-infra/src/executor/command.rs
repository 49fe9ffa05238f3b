//! Process-per-unit executor.
//!
//! Implements [`UnitExecutor`] by spawning a configured program once per work
//! item. The work item is written to the child's stdin as JSON; whatever the
//! child prints on stdout becomes the unit output (parsed as JSON when it is
//! valid JSON, otherwise kept as a string).

use std::process::Stdio;
use std::time::Duration;

use folio_core::workflow::executor::{RetryingExecutor, UnitError, UnitExecutor};
use folio_types::config::ExecutorConfig;
use folio_types::workflow::WorkItem;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Spawns `program args..` for each unit.
///
/// Spawn and pipe failures are reported as `UnitError::Transient`; a non-zero
/// exit is a terminal `UnitError::Failed` carrying the child's stderr. The
/// child is killed if the coordinator drops the attempt on timeout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build the executor described by `config`, wrapped in transient retries.
    pub fn from_config(config: &ExecutorConfig) -> RetryingExecutor<Self> {
        RetryingExecutor::new(
            Self::new(config.program.clone(), config.args.clone()),
            config.transient_retries,
            Duration::from_millis(config.backoff_ms),
        )
    }
}

/// Interpret child stdout: JSON if it parses, otherwise the trimmed text.
fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim_end();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

impl UnitExecutor for CommandExecutor {
    async fn run(&self, item: &WorkItem) -> Result<Value, UnitError> {
        let input = serde_json::to_vec(item)
            .map_err(|e| UnitError::Failed(format!("failed to encode work item: {e}")))?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| UnitError::Transient(format!("failed to spawn '{}': {e}", self.program)))?;

        // Feed stdin while stdout and stderr are drained, so a child that
        // echoes a large input cannot block on a full pipe.
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&input).await {
                    Ok(()) => {}
                    // The child may exit without reading its input.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e),
                }
                // stdin dropped here to signal EOF
            }
            Ok::<(), std::io::Error>(())
        };

        let (written, output) = tokio::join!(write, child.wait_with_output());
        written.map_err(|e| {
            UnitError::Transient(format!("failed to write work item to '{}': {e}", self.program))
        })?;
        let output = output.map_err(|e| {
            UnitError::Transient(format!("failed to wait for '{}': {e}", self.program))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                unit_id = item.id.as_str(),
                program = self.program.as_str(),
                status = %output.status,
                "unit process failed"
            );
            return Err(UnitError::Failed(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| UnitError::Failed(format!("output is not valid UTF-8: {e}")))?;
        Ok(parse_output(&stdout))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
