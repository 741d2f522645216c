//! The intervention queue — user messages arriving mid-turn, plus the
//! intervention-style error records the fail-fast policy writes.
//!
//! `poll` is the sole cross-task primitive in the hot path: it atomically
//! returns `(cancelled, unconsumed guidance)` and marks the messages
//! consumed. Error records respect backpressure caps; over-cap writes
//! merge into an open entry for the session/type and spill to the
//! emergency log so the main flow never blocks.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use cox_domain::config::InterventionConfig;
use cox_domain::error::ErrorKind;
use cox_domain::intervention::{classify, to_adjustment, GuidanceAdjustment, InterventionKind};
use cox_domain::turn::TurnPhase;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-session state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
struct Injection {
    at: DateTime<Utc>,
    content: String,
    kind: InterventionKind,
    consumed: bool,
}

#[derive(Debug, Clone, Serialize)]
struct SessionTurn {
    turn_id: String,
    phase: TurnPhase,
    started_at: DateTime<Utc>,
    injections: Vec<Injection>,
    cancelled: bool,
}

/// Result of one atomic poll.
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub cancelled: bool,
    pub guidance: Vec<GuidanceAdjustment>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error records (fail-fast log)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub session_id: String,
    pub error_type: ErrorKind,
    pub message: String,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    /// How many occurrences merged into this record.
    pub count: u32,
    pub resolved: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct InterventionQueue {
    sessions: Mutex<HashMap<String, SessionTurn>>,
    errors: Mutex<Vec<ErrorRecord>>,
    cfg: InterventionConfig,
    /// Mirror for external inspection (shared_state/intervention_queue.json).
    snapshot_path: Option<PathBuf>,
    /// Spill target when the error list is over cap.
    emergency_path: Option<PathBuf>,
}

impl InterventionQueue {
    pub fn new(
        cfg: InterventionConfig,
        snapshot_path: Option<PathBuf>,
        emergency_path: Option<PathBuf>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            cfg,
            snapshot_path,
            emergency_path,
        }
    }

    // ── Turn lifecycle ────────────────────────────────────────────

    pub fn begin_turn(&self, session_id: &str, turn_id: &str) {
        self.sessions.lock().insert(
            session_id.to_string(),
            SessionTurn {
                turn_id: turn_id.to_string(),
                phase: TurnPhase::Init,
                started_at: Utc::now(),
                injections: Vec::new(),
                cancelled: false,
            },
        );
        self.write_snapshot();
    }

    pub fn set_phase(&self, session_id: &str, phase: TurnPhase) {
        if let Some(turn) = self.sessions.lock().get_mut(session_id) {
            turn.phase = phase;
        }
    }

    /// Always runs on orchestrator exit (via the turn permit finalizer).
    pub fn end_turn(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
        self.write_snapshot();
    }

    pub fn has_active_turn(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    // ── Injection & polling ───────────────────────────────────────

    /// Deliver a mid-turn message. Classification happens here, on
    /// receipt. Returns the classification for the API acknowledgment.
    pub fn inject(&self, session_id: &str, text: &str) -> InterventionKind {
        let kind = classify(text);
        let mut sessions = self.sessions.lock();
        let Some(turn) = sessions.get_mut(session_id) else {
            tracing::warn!(session = session_id, "injection for session with no active turn");
            return kind;
        };
        match kind {
            InterventionKind::Cancel => {
                turn.cancelled = true;
                tracing::info!(session = session_id, turn = %turn.turn_id, "turn cancelled by user");
            }
            InterventionKind::Guide | InterventionKind::Redirect => {
                turn.injections.push(Injection {
                    at: Utc::now(),
                    content: text.to_string(),
                    kind,
                    consumed: false,
                });
            }
        }
        drop(sessions);
        self.write_snapshot();
        kind
    }

    /// Atomically read `(cancelled, unconsumed messages)`, marking the
    /// messages consumed.
    pub fn poll(&self, session_id: &str) -> PollResult {
        let mut sessions = self.sessions.lock();
        let Some(turn) = sessions.get_mut(session_id) else {
            return PollResult::default();
        };
        let mut guidance = Vec::new();
        for injection in turn.injections.iter_mut().filter(|i| !i.consumed) {
            injection.consumed = true;
            guidance.push(to_adjustment(&injection.content));
        }
        PollResult {
            cancelled: turn.cancelled,
            guidance,
        }
    }

    // ── Error records ─────────────────────────────────────────────

    /// Write an intervention-style record for a turn-halting error.
    /// Over-cap writes merge into an existing open record for the
    /// session/type and go to the emergency log.
    pub fn record_error(&self, session_id: &str, error_type: ErrorKind, message: &str) {
        let mut errors = self.errors.lock();

        let over_total = errors.iter().filter(|e| !e.resolved).count() >= self.cfg.max_total;
        let over_session = errors
            .iter()
            .filter(|e| !e.resolved && e.session_id == session_id)
            .count()
            >= self.cfg.max_per_session;
        let over_type = errors
            .iter()
            .filter(|e| !e.resolved && e.error_type == error_type)
            .count()
            >= self.cfg.max_per_error_type;

        if over_total || over_session || over_type {
            // Merge into an open entry when one exists.
            if let Some(open) = errors
                .iter_mut()
                .find(|e| !e.resolved && e.session_id == session_id && e.error_type == error_type)
            {
                open.count += 1;
                open.last_at = Utc::now();
            }
            drop(errors);
            self.emergency_log(session_id, error_type, message);
            return;
        }

        errors.push(ErrorRecord {
            session_id: session_id.to_string(),
            error_type,
            message: message.to_string(),
            first_at: Utc::now(),
            last_at: Utc::now(),
            count: 1,
            resolved: false,
        });
        drop(errors);
        self.write_snapshot();
    }

    pub fn error_records(&self) -> Vec<ErrorRecord> {
        self.errors.lock().clone()
    }

    fn emergency_log(&self, session_id: &str, error_type: ErrorKind, message: &str) {
        let Some(path) = &self.emergency_path else {
            return;
        };
        let line = format!(
            "{} {} {} {}\n",
            Utc::now().to_rfc3339(),
            session_id,
            error_type.as_str(),
            message.replace('\n', " ")
        );
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::error!(error = %e, "emergency log write failed");
        }
    }

    // ── Snapshot ──────────────────────────────────────────────────

    /// Mirror the queue to disk for external inspection. Best-effort.
    fn write_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let snapshot = serde_json::json!({
            "sessions": &*self.sessions.lock(),
            "errors": &*self.errors.lock(),
            "written_at": Utc::now(),
        });
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, serde_json::to_vec_pretty(&snapshot).unwrap_or_default())
        {
            tracing::warn!(error = %e, "intervention snapshot write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InterventionQueue {
        InterventionQueue::new(InterventionConfig::default(), None, None)
    }

    #[test]
    fn cancel_sets_flag_and_poll_reports_it() {
        let q = queue();
        q.begin_turn("s1", "turn_000001");
        assert_eq!(q.inject("s1", "cancel"), InterventionKind::Cancel);

        let poll = q.poll("s1");
        assert!(poll.cancelled);
        assert!(poll.guidance.is_empty());
    }

    #[test]
    fn guidance_consumed_exactly_once() {
        let q = queue();
        q.begin_turn("s1", "turn_000001");
        q.inject("s1", "skip bestbuy");
        q.inject("s1", "also check newegg");

        let first = q.poll("s1");
        assert_eq!(first.guidance.len(), 2);
        assert!(matches!(
            first.guidance[0],
            GuidanceAdjustment::SkipVendor { .. }
        ));

        let second = q.poll("s1");
        assert!(second.guidance.is_empty());
        assert!(!second.cancelled);
    }

    #[test]
    fn redirect_is_stored_as_opaque_guidance() {
        let q = queue();
        q.begin_turn("s1", "turn_000001");
        assert_eq!(
            q.inject("s1", "actually find desktops instead"),
            InterventionKind::Redirect
        );
        let poll = q.poll("s1");
        assert!(matches!(
            poll.guidance[0],
            GuidanceAdjustment::Guidance { .. }
        ));
    }

    #[test]
    fn poll_without_turn_is_empty() {
        let q = queue();
        let poll = q.poll("ghost");
        assert!(!poll.cancelled);
        assert!(poll.guidance.is_empty());
    }

    #[test]
    fn end_turn_clears_state() {
        let q = queue();
        q.begin_turn("s1", "turn_000001");
        q.inject("s1", "cancel");
        q.end_turn("s1");
        assert!(!q.has_active_turn("s1"));
        assert!(!q.poll("s1").cancelled);
    }

    #[test]
    fn error_cap_per_type_merges_and_spills() {
        let tmp = tempfile::tempdir().unwrap();
        let emergency = tmp.path().join("emergency.log");
        let q = InterventionQueue::new(
            InterventionConfig {
                max_total: 50,
                max_per_session: 50,
                max_per_error_type: 2,
            },
            None,
            Some(emergency.clone()),
        );

        q.record_error("s1", ErrorKind::LlmError, "timeout 1");
        q.record_error("s1", ErrorKind::LlmError, "timeout 2");
        // Third hits the per-type cap: merged + spilled.
        q.record_error("s1", ErrorKind::LlmError, "timeout 3");

        let records = q.error_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().map(|r| r.count).sum::<u32>(), 3);
        assert!(emergency.exists());
        let log = std::fs::read_to_string(&emergency).unwrap();
        assert!(log.contains("llm_error"));
    }

    #[test]
    fn per_session_cap_applies() {
        let q = InterventionQueue::new(
            InterventionConfig {
                max_total: 50,
                max_per_session: 1,
                max_per_error_type: 10,
            },
            None,
            None,
        );
        q.record_error("s1", ErrorKind::ToolError, "boom");
        q.record_error("s1", ErrorKind::ParseError, "bad json");
        // Different type, same session: capped, no open entry of that type
        // to merge into — record count stays 1.
        assert_eq!(q.error_records().len(), 1);
    }

    #[test]
    fn snapshot_written_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("shared_state/intervention_queue.json");
        let q = InterventionQueue::new(InterventionConfig::default(), Some(path.clone()), None);
        q.begin_turn("s1", "turn_000001");
        assert!(path.exists());
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("turn_000001"));
    }
}
