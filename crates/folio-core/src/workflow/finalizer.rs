//! Finalizer: reduces completed unit outputs into the job artifact.
//!
//! Sections follow `all_clusters` order, never arrival order. Abandoned units
//! are skipped and listed in a trailing partial-completion marker.

use chrono::Utc;
use folio_types::workflow::{Artifact, ArtifactSection, WorkflowState};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FinalizeError {
    #[error("artifact already assembled")]
    AlreadyFinalized,

    #[error("units neither completed nor abandoned: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    #[error("completed unit '{0}' has no result")]
    MissingResult(String),
}

/// Build the artifact for a fully resolved snapshot.
pub fn assemble(state: &WorkflowState) -> Result<Artifact, FinalizeError> {
    if state.is_finalized() {
        return Err(FinalizeError::AlreadyFinalized);
    }
    let unresolved = state.missing_ids();
    if !unresolved.is_empty() {
        return Err(FinalizeError::Unresolved(unresolved));
    }

    let mut sections = Vec::with_capacity(state.all_clusters.len());
    let mut omitted = Vec::new();
    for cluster in &state.all_clusters {
        if state.abandoned_ids.contains(&cluster.id) {
            omitted.push(cluster.id.clone());
            continue;
        }
        let output = state
            .results_by_id
            .get(&cluster.id)
            .ok_or_else(|| FinalizeError::MissingResult(cluster.id.clone()))?;
        sections.push(ArtifactSection {
            unit_id: cluster.id.clone(),
            group_key: cluster.meta.group_key.clone(),
            output: output.clone(),
        });
    }

    let document = render_document(&sections, &omitted);
    Ok(Artifact {
        complete: omitted.is_empty(),
        sections,
        omitted,
        document,
        assembled_at: Utc::now(),
    })
}

/// Join section outputs with blank lines. Strings are used verbatim, other
/// values pretty-printed.
pub fn render_document(sections: &[ArtifactSection], omitted: &[String]) -> String {
    let mut parts: Vec<String> = sections.iter().map(|s| render_output(&s.output)).collect();
    if !omitted.is_empty() {
        parts.push(format!(
            "[partial: {} of {} sections omitted: {}]",
            omitted.len(),
            sections.len() + omitted.len(),
            omitted.join(", ")
        ));
    }
    parts.join("\n\n")
}

fn render_output(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
