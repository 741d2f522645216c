//! Persisted directory layout.
//!
//! ```text
//! {root}/
//!   users/{user_id}/
//!     turns/turn_{NNNNNN}/
//!       context.md  response.md  metadata.json  metrics.json
//!       plan_state.json?  toolresults.md?
//!     preferences.md
//!     Knowledge/
//!     Knowledge_staging/
//!     Logs/reflector/
//!   indexes/
//!     turn_index.db  research_index.db
//!   observability/
//!     calibration.db
//!   shared_state/
//!     intervention_queue.json
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_root(&self, user_id: &str) -> PathBuf {
        self.root.join("users").join(user_id)
    }

    pub fn turns_dir(&self, user_id: &str) -> PathBuf {
        self.user_root(user_id).join("turns")
    }

    pub fn turn_dir(&self, user_id: &str, turn_number: u64) -> PathBuf {
        self.turns_dir(user_id).join(turn_id(turn_number))
    }

    pub fn preferences_file(&self, user_id: &str) -> PathBuf {
        self.user_root(user_id).join("preferences.md")
    }

    pub fn knowledge_dir(&self, user_id: &str) -> PathBuf {
        self.user_root(user_id).join("Knowledge")
    }

    pub fn staging_dir(&self, user_id: &str) -> PathBuf {
        self.user_root(user_id).join("Knowledge_staging")
    }

    pub fn reflector_log_dir(&self, user_id: &str) -> PathBuf {
        self.user_root(user_id).join("Logs").join("reflector")
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join("indexes")
    }

    pub fn turn_index_file(&self) -> PathBuf {
        self.indexes_dir().join("turn_index.db")
    }

    pub fn research_index_file(&self) -> PathBuf {
        self.indexes_dir().join("research_index.db")
    }

    pub fn calibration_file(&self) -> PathBuf {
        self.root.join("observability").join("calibration.db")
    }

    pub fn intervention_snapshot_file(&self) -> PathBuf {
        self.root.join("shared_state").join("intervention_queue.json")
    }

    pub fn emergency_log_file(&self) -> PathBuf {
        self.root.join("shared_state").join("emergency.log")
    }
}

/// Directory-style turn id: `turn_000042`.
pub fn turn_id(turn_number: u64) -> String {
    format!("turn_{turn_number:06}")
}

/// Parse a `turn_{NNNNNN}` id back into its number.
pub fn parse_turn_id(id: &str) -> Option<u64> {
    id.strip_prefix("turn_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_id_round_trip() {
        assert_eq!(turn_id(42), "turn_000042");
        assert_eq!(parse_turn_id("turn_000042"), Some(42));
        assert_eq!(parse_turn_id("turn_999999"), Some(999_999));
        assert_eq!(parse_turn_id("nope"), None);
    }

    #[test]
    fn layout_paths_compose() {
        let layout = Layout::new("/data");
        assert_eq!(
            layout.turn_dir("u1", 7),
            PathBuf::from("/data/users/u1/turns/turn_000007")
        );
        assert_eq!(
            layout.staging_dir("u1"),
            PathBuf::from("/data/users/u1/Knowledge_staging")
        );
        assert_eq!(
            layout.turn_index_file(),
            PathBuf::from("/data/indexes/turn_index.db")
        );
        assert_eq!(
            layout.intervention_snapshot_file(),
            PathBuf::from("/data/shared_state/intervention_queue.json")
        );
    }
}
