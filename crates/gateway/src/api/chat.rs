//! `POST /api/chat` — the user request endpoint.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use cox_domain::error::ErrorKind;
use cox_domain::intervention::InterventionKind;
use cox_domain::turn::{Mode, TurnPhase, TurnStatus};

use crate::runtime::{handle_message, HandleResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub mode: Mode,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_reached: Option<TurnPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_results: Option<String>,
}

pub async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Json<ChatResponse> {
    match handle_message(&state, &req.session_id, &req.message, req.mode).await {
        HandleResult::Injected(kind) => Json(ChatResponse {
            response: match kind {
                InterventionKind::Cancel => "Cancelling the current request.".into(),
                InterventionKind::Guide => "Noted — I'll adjust the current request.".into(),
                InterventionKind::Redirect => {
                    "Noted — I'll fold that into the current request.".into()
                }
            },
            status: "injected".into(),
            error_type: None,
            phase_reached: None,
            partial_results: None,
        }),
        HandleResult::Completed(outcome) => Json(ChatResponse {
            response: outcome.response,
            status: match outcome.status {
                TurnStatus::Ok => "ok",
                TurnStatus::Cancelled => "cancelled",
                TurnStatus::CancelledPartial => "cancelled_partial",
                TurnStatus::Failed => "failed",
            }
            .into(),
            error_type: outcome.error_type,
            phase_reached: Some(outcome.phase_reached),
            partial_results: outcome.partial_results,
        }),
    }
}
