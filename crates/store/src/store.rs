//! Turn directory persistence — creates `turn_{NNNNNN}/` and writes the
//! document, response, metadata, and metrics files.
//!
//! Turn numbering is monotonic per user and derived from the directory
//! listing at startup, then cached. Every write failure propagates
//! (fail-fast); there is no partial-success path.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use cox_domain::error::{Error, Result};
use cox_domain::turn::TurnDocument;

use crate::document::{parse_sections, ParsedDocument};
use crate::layout::{parse_turn_id, turn_id, Layout};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metadata / metrics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub turn_number: u64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub workflows_used: Vec<String>,
    #[serde(default)]
    pub claims_count: usize,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Per-stage timing/tokens plus the decision trail for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub stages: Vec<StageMetric>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Routing decisions in order (validator verdicts, planner routes, ...).
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub validation_outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetric {
    pub stage: String,
    pub duration_ms: u64,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Which forgiving-parser strategy produced the output.
    #[serde(default)]
    pub parse_strategy: Option<String>,
}

impl TurnMetrics {
    pub fn total_tokens(&self) -> (u32, u32) {
        self.stages.iter().fold((0, 0), |(i, o), s| {
            (i + s.tokens_in, o + s.tokens_out)
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnStore {
    layout: Layout,
    /// user_id -> next turn number; seeded lazily from disk.
    counters: Mutex<HashMap<String, u64>>,
}

impl TurnStore {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Allocate the next turn number for a user (monotonic, scan-seeded).
    pub fn next_turn_number(&self, user_id: &str) -> Result<u64> {
        let mut counters = self.counters.lock();
        let next = match counters.get(user_id) {
            Some(n) => n + 1,
            None => self.scan_max_turn(user_id)? + 1,
        };
        counters.insert(user_id.to_string(), next);
        Ok(next)
    }

    fn scan_max_turn(&self, user_id: &str) -> Result<u64> {
        let dir = self.layout.turns_dir(user_id);
        if !dir.exists() {
            return Ok(0);
        }
        let mut max = 0u64;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(n) = parse_turn_id(name) {
                    max = max.max(n);
                }
            }
        }
        Ok(max)
    }

    /// Persist a completed turn: directory, context.md, response.md,
    /// metadata.json, metrics.json, and optionally toolresults.md.
    pub fn save_turn(
        &self,
        user_id: &str,
        turn_number: u64,
        document: &TurnDocument,
        response: &str,
        metadata: &TurnMetadata,
        metrics: &TurnMetrics,
        tool_results: Option<&str>,
    ) -> Result<PathBuf> {
        let dir = self.layout.turn_dir(user_id, turn_number);
        std::fs::create_dir_all(&dir)?;

        std::fs::write(dir.join("context.md"), document.render())?;
        std::fs::write(dir.join("response.md"), response)?;
        std::fs::write(
            dir.join("metadata.json"),
            serde_json::to_string_pretty(metadata)?,
        )?;
        std::fs::write(
            dir.join("metrics.json"),
            serde_json::to_string_pretty(metrics)?,
        )?;
        if let Some(results) = tool_results {
            std::fs::write(dir.join("toolresults.md"), results)?;
        }

        tracing::debug!(user = user_id, turn = turn_number, "turn persisted");
        Ok(dir)
    }

    /// Read back a turn's parsed context document.
    pub fn read_context(&self, user_id: &str, turn_number: u64) -> Result<ParsedDocument> {
        let path = self.layout.turn_dir(user_id, turn_number).join("context.md");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::Other(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(parse_sections(&raw))
    }

    pub fn read_metadata(&self, user_id: &str, turn_number: u64) -> Result<TurnMetadata> {
        let path = self
            .layout
            .turn_dir(user_id, turn_number)
            .join("metadata.json");
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn read_response(&self, user_id: &str, turn_number: u64) -> Result<String> {
        let path = self
            .layout
            .turn_dir(user_id, turn_number)
            .join("response.md");
        Ok(std::fs::read_to_string(&path)?)
    }

    /// The newest `limit` turn numbers for a user, descending.
    pub fn recent_turns(&self, user_id: &str, limit: usize) -> Result<Vec<u64>> {
        let dir = self.layout.turns_dir(user_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut numbers: Vec<u64> = std::fs::read_dir(&dir)?
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(parse_turn_id))
            .collect();
        numbers.sort_unstable_by(|a, b| b.cmp(a));
        numbers.truncate(limit);
        Ok(numbers)
    }

    /// Ensure the user's fixed directories exist (first turn of a user).
    pub fn ensure_user_dirs(&self, user_id: &str) -> Result<()> {
        for dir in [
            self.layout.turns_dir(user_id),
            self.layout.knowledge_dir(user_id),
            self.layout.staging_dir(user_id),
            self.layout.reflector_log_dir(user_id),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn turn_dir_name(turn_number: u64) -> String {
        turn_id(turn_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cox_domain::turn::Mode;

    fn store() -> (tempfile::TempDir, TurnStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TurnStore::new(Layout::new(tmp.path()));
        (tmp, store)
    }

    fn metadata(n: u64) -> TurnMetadata {
        TurnMetadata {
            turn_number: n,
            session_id: "s1".into(),
            timestamp: Utc::now(),
            topic: "laptops".into(),
            workflows_used: vec![],
            claims_count: 0,
            quality_score: 0.8,
            content_type: "general_fact".into(),
            keywords: vec!["laptop".into()],
        }
    }

    #[test]
    fn numbering_is_monotonic_and_scan_seeded() {
        let (_tmp, store) = store();
        assert_eq!(store.next_turn_number("u1").unwrap(), 1);
        assert_eq!(store.next_turn_number("u1").unwrap(), 2);

        // Save a turn and rebuild the store: the scan picks up where we left.
        let doc = TurnDocument::new("turn_000002", "s1", Mode::Chat);
        store
            .save_turn("u1", 2, &doc, "resp", &metadata(2), &TurnMetrics::default(), None)
            .unwrap();
        let rebuilt = TurnStore::new(store.layout.clone());
        assert_eq!(rebuilt.next_turn_number("u1").unwrap(), 3);
    }

    #[test]
    fn save_writes_all_files() {
        let (_tmp, store) = store();
        let mut doc = TurnDocument::new("turn_000001", "s1", Mode::Chat);
        doc.append_simple(0, None, "hello".into()).unwrap();
        let dir = store
            .save_turn(
                "u1",
                1,
                &doc,
                "hi there",
                &metadata(1),
                &TurnMetrics::default(),
                Some("full tool output"),
            )
            .unwrap();

        assert!(dir.join("context.md").exists());
        assert!(dir.join("response.md").exists());
        assert!(dir.join("metadata.json").exists());
        assert!(dir.join("metrics.json").exists());
        assert!(dir.join("toolresults.md").exists());

        let parsed = store.read_context("u1", 1).unwrap();
        assert_eq!(parsed.latest(0).unwrap().body, "hello");
        assert_eq!(store.read_response("u1", 1).unwrap(), "hi there");
        assert_eq!(store.read_metadata("u1", 1).unwrap().topic, "laptops");
    }

    #[test]
    fn recent_turns_descending() {
        let (_tmp, store) = store();
        for n in 1..=4 {
            let doc = TurnDocument::new(&turn_id(n), "s1", Mode::Chat);
            store
                .save_turn("u1", n, &doc, "r", &metadata(n), &TurnMetrics::default(), None)
                .unwrap();
        }
        assert_eq!(store.recent_turns("u1", 3).unwrap(), vec![4, 3, 2]);
    }

    #[test]
    fn missing_context_is_an_error() {
        let (_tmp, store) = store();
        assert!(store.read_context("u1", 99).is_err());
    }

    #[test]
    fn metrics_totals_sum_across_stages() {
        let metrics = TurnMetrics {
            stages: vec![
                StageMetric {
                    stage: "analyze".into(),
                    duration_ms: 100,
                    tokens_in: 500,
                    tokens_out: 100,
                    parse_strategy: Some("strict".into()),
                },
                StageMetric {
                    stage: "plan".into(),
                    duration_ms: 200,
                    tokens_in: 700,
                    tokens_out: 200,
                    parse_strategy: Some("repair".into()),
                },
            ],
            ..TurnMetrics::default()
        };
        assert_eq!(metrics.total_tokens(), (1200, 300));
    }
}
