//! Save/index pipeline — post-response persistence.
//!
//! Writes the turn directory, updates the turn index (always) and the
//! research index (when a research workflow ran), appends the REFLEX
//! one-shot turn summary to the document, and feeds the reflector's
//! signal accumulator. Every write failure halts.

use chrono::{Duration, Utc};

use cox_domain::error::Result;
use cox_domain::recipe::StageName;
use cox_domain::turn::TurnStatus;
use cox_store::layout::turn_id;
use cox_store::{ResearchIndexEntry, TurnIndexEntry, TurnMetadata};

use crate::state::AppState;

use super::orchestrator::{TurnOutcome, TurnRun};
use super::reflector::TurnSignals;
use super::schemas::turn_summary_schema;
use super::stages::PromptSection;

pub(crate) async fn save_turn(
    state: &AppState,
    run: &mut TurnRun<'_>,
    outcome: &TurnOutcome,
) -> Result<()> {
    let user_id = run.session_id.clone();
    let now = Utc::now();

    // ── Turn summary (skipped for aborted/failed turns) ───────────
    let mut topic = run.analysis.topic.clone();
    let mut keywords = run.analysis.keywords.clone();
    let mut content_type = "general_fact".to_string();

    if outcome.status == TurnStatus::Ok {
        let sections = vec![
            PromptSection::protected("Query", &run.query),
            PromptSection::new("Response", &outcome.response, 1, 1.0, 2),
        ];
        let out = state
            .stages
            .run_stage(
                StageName::TurnSummary,
                &sections,
                "Summarize this turn in one short paragraph.",
                &turn_summary_schema(),
            )
            .await?;
        run.metrics.stages.push(out.metric.clone());

        let summary = out.value["summary"].as_str().unwrap_or("").to_string();
        run.doc.set_appendix(summary)?;

        if let Some(t) = out.value["topic"].as_str() {
            if !t.is_empty() {
                topic = t.to_string();
            }
        }
        if let Some(ct) = out.value["content_type"].as_str() {
            if !ct.is_empty() {
                content_type = ct.to_string();
            }
        }
        if let Some(extra) = out.value["keywords"].as_array() {
            for k in extra.iter().filter_map(|v| v.as_str()) {
                if !keywords.iter().any(|existing| existing == k) {
                    keywords.push(k.to_string());
                }
            }
        }
    }

    // ── Turn directory ────────────────────────────────────────────
    let metadata = TurnMetadata {
        turn_number: run.turn_number,
        session_id: run.session_id.clone(),
        timestamp: now,
        topic: topic.clone(),
        workflows_used: run.workflows_used.clone(),
        claims_count: run.claims.len(),
        quality_score: run.quality_score,
        content_type: content_type.clone(),
        keywords,
    };
    let tool_results = (!run.tool_results_md.is_empty()).then_some(run.tool_results_md.as_str());
    let dir = state.turns.save_turn(
        &user_id,
        run.turn_number,
        &run.doc,
        &outcome.response,
        &metadata,
        &run.metrics,
        tool_results,
    )?;

    // Plan state rides alongside when the turn got as far as planning.
    if run.doc.has_section(3) {
        let plan_state = serde_json::json!({
            "attempts": run.doc.entry_count(3),
            "decisions": run.metrics.decisions,
            "validation_outcome": run.metrics.validation_outcome,
        });
        std::fs::write(
            dir.join("plan_state.json"),
            serde_json::to_vec_pretty(&plan_state)?,
        )?;
    }

    // Calibration: predicted per-source confidence vs the validator's
    // observed quality for this turn.
    if outcome.status == TurnStatus::Ok && run.quality_score > 0.0 {
        for entry in run.doc.entries(2) {
            if let Some(meta) = &entry.meta {
                for node_id in &meta.node_ids {
                    state
                        .calibration
                        .record(node_id, meta.confidence_avg, run.quality_score)?;
                }
            }
        }
    }

    // ── Indexes ───────────────────────────────────────────────────
    let turn_dir = format!("users/{user_id}/turns/{}", turn_id(run.turn_number));
    state.turn_index.append(&TurnIndexEntry {
        session_id: run.session_id.clone(),
        timestamp: now,
        quality_score: run.quality_score,
        turn_dir: turn_dir.clone(),
    })?;

    let research_ran = run
        .workflows_used
        .iter()
        .any(|w| w.contains("research"))
        || run.claims.iter().any(|c| c.ttl_secs.is_some());
    if research_ran && !topic.is_empty() {
        let ttl = run
            .claims
            .iter()
            .filter_map(|c| c.ttl_secs)
            .max()
            .unwrap_or(7 * 86_400);
        state.research_index.append(&ResearchIndexEntry {
            primary_topic: topic.clone(),
            quality_score: run.quality_score,
            created_at: now,
            expires_at: now + Duration::seconds(ttl as i64),
            content_type: content_type.clone(),
            turn_dir,
        })?;
    }

    // ── Reflector signals (main pipeline is the only writer) ──────
    if state.config.reflector.enabled && outcome.status == TurnStatus::Ok {
        let signals = TurnSignals {
            topic,
            corrected: looks_like_correction(&run.query),
            research_quality: research_ran.then_some(run.quality_score),
            routed_refresh: run
                .metrics
                .decisions
                .iter()
                .any(|d| d.contains("RefreshContext")),
            contradiction: contradiction_flagged(run),
        };
        if state.reflector.record_turn_signals(&user_id, &signals)? {
            let reflector = state.reflector.clone();
            let user = user_id.clone();
            // Background task; never on the hot path, never propagates.
            tokio::spawn(async move {
                reflector.run_batch(&user).await;
            });
        }
    }

    tracing::info!(
        user = %user_id,
        turn = run.turn_number,
        status = ?outcome.status,
        "turn saved"
    );
    Ok(())
}

/// Code-detected correction phrasing in the user's query.
fn looks_like_correction(query: &str) -> bool {
    let lowered = query.to_lowercase();
    ["that's wrong", "thats wrong", "no, it", "actually it", "i meant", "not what i"]
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

/// Did the validator flag a contradiction check as failed?
fn contradiction_flagged(run: &TurnRun<'_>) -> bool {
    run.doc.entries(7).iter().any(|entry| {
        entry
            .body
            .lines()
            .any(|line| line.contains("contradict") && line.contains("false"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_phrases_detected() {
        assert!(looks_like_correction("No, it was the Syrian hamster"));
        assert!(looks_like_correction("that's wrong, try again"));
        assert!(looks_like_correction("I meant the 16GB model"));
        assert!(!looks_like_correction("find me a laptop"));
    }
}
