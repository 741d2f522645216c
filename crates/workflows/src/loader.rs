//! Scan a directory of YAML workflow definitions.
//!
//! Invalid files are skipped with a warning; a missing directory yields an
//! empty set (the single-tool path still works without any workflows).

use std::path::Path;

use cox_domain::error::Result;
use cox_domain::workflow::Workflow;

pub fn scan_workflows(dir: &Path) -> Result<Vec<Workflow>> {
    if !dir.exists() {
        tracing::info!(dir = %dir.display(), "workflow directory missing; starting empty");
        return Ok(Vec::new());
    }

    let mut workflows = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if !matches!(ext, Some("yaml") | Some("yml")) {
            continue;
        }

        let raw = match std::fs::read_to_string(&path) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "skipping unreadable workflow file");
                continue;
            }
        };

        let workflow: Workflow = match serde_yaml::from_str(&raw) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "skipping unparseable workflow file");
                continue;
            }
        };

        let validation = workflow.validate();
        for warning in &validation.warnings {
            tracing::debug!(workflow = %workflow.name, warning = %warning, "workflow warning");
        }
        if !validation.is_valid() {
            for error in &validation.errors {
                tracing::warn!(path = %path.display(), error = %error, "workflow rejected");
            }
            continue;
        }

        workflows.push(workflow);
    }

    workflows.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::info!(count = workflows.len(), dir = %dir.display(), "workflows loaded");
    Ok(workflows)
}
