//! Job commands: run, resume, status, artifact, list.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use folio_core::event::JobEvents;
use folio_core::repository::state_store::StateStore;
use folio_core::workflow::controller::compose_status;
use folio_core::workflow::runner::TriggerParams;
use folio_types::event::JobEvent;
use folio_types::workflow::{JobPhase, JobStatus};

use super::ExecutionArgs;
use crate::state::{AppState, ConcreteController};

/// How often `wait` re-reads the snapshot while a job runs.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// run / resume
// ---------------------------------------------------------------------------

/// Start a new job from an inputs file and drive it to completion.
pub async fn run_job(
    state: &AppState,
    inputs: &Path,
    job_id: Option<String>,
    execution: ExecutionArgs,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let content = read_inputs(inputs).await?;
    let records = parse_inputs(&content)?;
    let job_id = job_id.unwrap_or_else(|| format!("job-{}", Uuid::now_v7()));

    let controller = state.controller(&execution.command)?;
    let events = state.event_bus.subscribe_job(job_id.as_str());
    controller
        .start(&job_id, records, trigger_params(&execution))
        .await?;

    if !json && !quiet {
        eprintln!(
            "  {} Started job {}",
            style("▶").cyan().bold(),
            style(&job_id).bold()
        );
    }

    drive(&controller, &job_id, events, (0, 0), &execution, json, quiet).await
}

/// Resume an interrupted job and drive it to completion.
pub async fn resume_job(
    state: &AppState,
    job_id: &str,
    execution: ExecutionArgs,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let controller = state.controller(&execution.command)?;
    let before = controller.status(job_id).await?;
    let settled = (before.progress.completed + before.progress.abandoned) as u64;
    let total = before.progress.total as u64;

    let events = state.event_bus.subscribe_job(job_id);
    controller
        .resume(job_id, trigger_params(&execution))
        .await?;

    if !json && !quiet {
        eprintln!(
            "  {} Resuming job {} from {} ({settled}/{total} settled)",
            style("▶").cyan().bold(),
            style(job_id).bold(),
            before.phase
        );
    }

    drive(&controller, job_id, events, (settled, total), &execution, json, quiet).await
}

fn trigger_params(execution: &ExecutionArgs) -> TriggerParams {
    TriggerParams {
        concurrency: execution.concurrency,
        max_retries: execution.max_retries,
    }
}

/// Wait for the job with a progress bar, cancel on Ctrl-C, then report.
async fn drive(
    controller: &ConcreteController,
    job_id: &str,
    events: JobEvents,
    (position, length): (u64, u64),
    execution: &ExecutionArgs,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let bar = if json || quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(length);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.cyan} [{bar:30.cyan/dim}] {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    };
    bar.set_position(position);
    let progress = spawn_progress(events, bar.clone());

    let status = tokio::select! {
        status = controller.wait(job_id, POLL_INTERVAL) => status?,
        _ = tokio::signal::ctrl_c() => {
            bar.println(format!(
                "  {} Cancelling after the current wave...",
                style("■").yellow()
            ));
            controller.cancel(job_id).await?;
            controller.wait(job_id, POLL_INTERVAL).await?
        }
    };

    progress.abort();
    bar.finish_and_clear();

    let snapshot = controller.snapshot(job_id).await?;
    let document = snapshot
        .final_artifact
        .as_ref()
        .map(|artifact| artifact.document.as_str());

    if let (Some(document), Some(path)) = (document, execution.output.as_deref()) {
        tokio::fs::write(path, document)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    if json {
        let report = serde_json::json!({
            "status": status,
            "document": document.filter(|_| execution.output.is_none()),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let (Some(document), None) = (document, execution.output.as_deref()) {
            println!("{document}");
        }
        if !quiet {
            print_outcome(&status, execution.output.as_deref());
        }
    }

    finish(&status)
}

/// Forward the job's coordinator events into the progress bar.
fn spawn_progress(mut events: JobEvents, bar: ProgressBar) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(JobEvent::JobStarted { total_units, .. }) => bar.set_length(total_units as u64),
                Ok(JobEvent::WaveDispatched { wave, unit_ids, .. }) => {
                    bar.set_message(format!("wave {wave} ({} units)", unit_ids.len()));
                }
                Ok(JobEvent::UnitCompleted { .. }) => bar.inc(1),
                Ok(JobEvent::UnitFailed {
                    unit_id,
                    error,
                    will_retry: true,
                    ..
                }) => {
                    bar.println(format!(
                        "  {} {unit_id} failed, will retry: {error}",
                        style("↻").yellow()
                    ));
                }
                Ok(JobEvent::UnitFailed { .. }) => {}
                Ok(JobEvent::UnitAbandoned {
                    unit_id,
                    retry_count,
                    ..
                }) => {
                    bar.inc(1);
                    bar.println(format!(
                        "  {} {unit_id} abandoned after {retry_count} attempts",
                        style("✗").red()
                    ));
                }
                Ok(JobEvent::JobFinished { .. }) => break,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress display lagged behind job events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_outcome(status: &JobStatus, output: Option<&Path>) {
    let progress = &status.progress;
    eprintln!();
    match status.phase {
        JobPhase::Done if status.fully_succeeded() => eprintln!(
            "  {} Job {} done: {} of {} units",
            style("✓").green().bold(),
            style(&status.job_id).bold(),
            progress.completed,
            progress.total
        ),
        JobPhase::Done => eprintln!(
            "  {} Job {} done with a partial document: {} of {} units, abandoned: {}",
            style("!").yellow().bold(),
            style(&status.job_id).bold(),
            progress.completed,
            progress.total,
            status.abandoned_ids.join(", ")
        ),
        phase => eprintln!(
            "  {} Job {} {}",
            style("✗").red().bold(),
            style(&status.job_id).bold(),
            phase_style(phase)
        ),
    }
    if let Some(path) = output.filter(|_| status.phase == JobPhase::Done) {
        eprintln!("  Document written to {}", style(path.display()).cyan());
    }
    eprintln!();
}

/// Map a settled status to the process result.
fn finish(status: &JobStatus) -> Result<()> {
    match status.phase {
        JobPhase::Done => Ok(()),
        JobPhase::Cancelled => bail!(
            "job '{}' cancelled with {} of {} units completed",
            status.job_id,
            status.progress.completed,
            status.progress.total
        ),
        phase => bail!(
            "job '{}' {}: {}",
            status.job_id,
            phase,
            status.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

async fn read_inputs(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut content = String::new();
        tokio::io::stdin()
            .read_to_string(&mut content)
            .await
            .context("failed to read inputs from stdin")?;
        return Ok(content);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read inputs from {}", path.display()))
}

/// Parse a JSON array of records, or one JSON value per line (JSON Lines).
pub fn parse_inputs(content: &str) -> Result<Vec<Value>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("inputs are not a valid JSON array");
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("invalid JSON on line {}", n + 1))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// status / artifact / list
// ---------------------------------------------------------------------------

/// Show the stored status of a job.
pub async fn show_status(state: &AppState, job_id: &str, json: bool) -> Result<()> {
    let snapshot = state.store.load(job_id).await?;
    let status = compose_status(
        job_id,
        snapshot.as_ref(),
        None,
        state.config.engine.recent_log_limit,
    )
    .ok_or_else(|| anyhow!("job '{job_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let progress = &status.progress;
    println!();
    println!(
        "  {} {}",
        style(&status.job_id).bold(),
        phase_style(status.phase)
    );
    println!();
    println!(
        "  Units:     {} completed of {}",
        style(progress.completed).green(),
        progress.total
    );
    println!(
        "  Remaining: {} pending, {} active",
        progress.pending, progress.active
    );
    if !status.abandoned_ids.is_empty() {
        println!(
            "  Abandoned: {}",
            style(status.abandoned_ids.join(", ")).red()
        );
    }
    if let Some(error) = &status.error {
        println!("  Error:     {}", style(error).red());
    }

    if !status.recent_logs.is_empty() {
        println!();
        println!("  {}", style("── Recent activity ──").dim());
        for entry in &status.recent_logs {
            println!(
                "  {} {}",
                style(entry.at.with_timezone(&chrono::Local).format("%H:%M:%S")).dim(),
                entry.message
            );
        }
    }
    println!();
    Ok(())
}

/// Print or save the document of a finished job.
pub async fn show_artifact(state: &AppState, job_id: &str, output: Option<&Path>) -> Result<()> {
    let snapshot = state
        .store
        .load(job_id)
        .await?
        .ok_or_else(|| anyhow!("job '{job_id}' not found"))?;
    let artifact = snapshot
        .final_artifact
        .ok_or_else(|| anyhow!("job '{job_id}' has no document yet ({})", snapshot.phase))?;

    match output {
        Some(path) => tokio::fs::write(path, &artifact.document)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{}", artifact.document),
    }
    if !artifact.complete {
        tracing::warn!(
            job_id,
            omitted = artifact.omitted.len(),
            "document is partial"
        );
    }
    Ok(())
}

/// List stored jobs, most recently updated first.
pub async fn list_jobs(state: &AppState, json: bool) -> Result<()> {
    let jobs = state.store.list_jobs().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs yet. Start one with {}", style("folio run <inputs>").cyan());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Job").fg(Color::White),
        Cell::new("Phase").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for job in &jobs {
        table.add_row(vec![
            Cell::new(&job.job_id),
            Cell::new(job.phase.as_str()).fg(phase_color(job.phase)),
            Cell::new(
                job.updated_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S"),
            ),
        ]);
    }

    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn phase_color(phase: JobPhase) -> Color {
    match phase {
        JobPhase::Done => Color::Green,
        JobPhase::Cancelled => Color::Yellow,
        JobPhase::Failed | JobPhase::Crashed => Color::Red,
        _ => Color::Cyan,
    }
}

fn phase_style(phase: JobPhase) -> console::StyledObject<&'static str> {
    let styled = style(phase.as_str());
    match phase {
        JobPhase::Done => styled.green(),
        JobPhase::Cancelled => styled.yellow(),
        JobPhase::Failed | JobPhase::Crashed => styled.red(),
        _ => styled.cyan(),
    }
}
