use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage & workflows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root of the persisted layout (`users/`, `indexes/`, `observability/`,
/// `shared_state/` live under it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root: d_root() }
    }
}

fn d_root() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowsConfig {
    /// Directory of YAML workflow definitions.
    #[serde(default = "d_workflows_dir")]
    pub dir: PathBuf,
    /// Minimum match confidence; below it the command takes the
    /// single-tool path.
    #[serde(default = "d_match_threshold")]
    pub match_threshold: f64,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            dir: d_workflows_dir(),
            match_threshold: d_match_threshold(),
        }
    }
}

fn d_workflows_dir() -> PathBuf {
    PathBuf::from("./workflows")
}
fn d_match_threshold() -> f64 {
    0.7
}
