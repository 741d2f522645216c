//! Health and admin endpoints.

use axum::extract::State;
use axum::Json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "active_turns": state.session_locks.active_count(),
        "workflows": state.workflows.len(),
        "pending_approvals": state.approvals.list_pending().len(),
    }))
}

/// Admin signal: re-scan the workflow directory.
pub async fn reload_workflows(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.workflows.reload() {
        Ok(count) => Json(serde_json::json!({"reloaded": true, "workflows": count})),
        Err(e) => Json(serde_json::json!({"reloaded": false, "error": e.to_string()})),
    }
}
