//! Approval resolution endpoints.
//!
//! `GET /api/permissions/pending` lists awaiting approvals;
//! `POST /api/permissions/{id}/resolve` resolves one.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use cox_tools::ApprovalInfo;

use crate::state::AppState;

pub async fn pending(State(state): State<AppState>) -> Json<Vec<ApprovalInfo>> {
    Json(state.approvals.list_pending())
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub decision: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let resolved = match req.decision.as_str() {
        "approve" => state.approvals.approve(&id),
        "deny" => state.approvals.deny(&id, req.reason),
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("decision must be approve|deny (got \"{other}\")")
                })),
            )
        }
    };
    if resolved {
        (StatusCode::OK, Json(serde_json::json!({"resolved": true})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no pending approval with that id"})),
        )
    }
}
