//! Per-session active-turn lock.
//!
//! Test-and-set at request entry: at most one turn per session is ever in
//! progress. A second arrival while the lock is held is routed to the
//! intervention queue instead of waiting. Release happens in the terminal
//! transition, guaranteed by [`TurnPermit`]'s drop.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::interventions::InterventionQueue;

#[derive(Default)]
pub struct ActiveTurnLocks {
    active: Mutex<HashSet<String>>,
}

impl ActiveTurnLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the session's turn slot. `false` = a turn is active.
    pub fn try_begin(&self, session_id: &str) -> bool {
        self.active.lock().insert(session_id.to_string())
    }

    pub fn end(&self, session_id: &str) {
        self.active.lock().remove(session_id);
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.lock().contains(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Finalizer for a running turn: releases the active-turn lock and closes
/// the session's intervention window no matter how the turn exits.
pub struct TurnPermit {
    locks: Arc<ActiveTurnLocks>,
    interventions: Arc<InterventionQueue>,
    session_id: String,
}

impl TurnPermit {
    pub fn new(
        locks: Arc<ActiveTurnLocks>,
        interventions: Arc<InterventionQueue>,
        session_id: &str,
    ) -> Self {
        Self {
            locks,
            interventions,
            session_id: session_id.to_string(),
        }
    }
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        self.interventions.end_turn(&self.session_id);
        self.locks.end(&self.session_id);
    }
}
