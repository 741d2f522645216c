//! The turn orchestrator — the state machine that drives one turn through
//! the staged pipeline.
//!
//! Sequence: 1 Analyze → 1.5 Validate-analysis → 2.1 Retrieve →
//! 2.2 Synthesize-context → 2.5 Validate-context → 3 Plan →
//! (4/5 Executor–Coordinator loop) → 6 Synthesize → 7 Validate → Save.
//!
//! The orchestrator owns every loop budget: validation-helper retries (1),
//! context refreshes (1), executor iterations (10), REVISE (2), RETRY (1).
//! Validators stay stateless. The intervention queue is polled before every
//! stage and every tool call; cancellation is honored at the next
//! checkpoint, never mid-tool. Any unhandled error halts the turn
//! (fail-fast) with an intervention record and a generic user message.

use chrono::Utc;

use cox_domain::claim::Claim;
use cox_domain::error::{Error, ErrorKind, Result};
use cox_domain::intervention::{GuidanceAdjustment, InterventionKind};
use cox_domain::recipe::StageName;
use cox_domain::turn::{
    section_title, Mode, QuerySection, ReferenceStatus, SectionEntry, SectionMeta, TurnDocument,
    TurnPhase, TurnStatus,
};
use cox_memory::{MemoryRetriever, RetrieveOptions, SearchHit, SearchResults};
use cox_store::layout::turn_id;
use cox_store::TurnMetrics;
use cox_tools::ExecutionStatus;

use crate::state::AppState;

use super::save;
use super::schemas::{
    context_synthesis_schema, coordinator_schema, executor_action_schema, final_validation_schema,
    helper_verdict_schema, query_analysis_schema, strategic_plan_schema, synthesis_schema,
    ContextSynthesis, CoordinatorTranslation, ExecutorAction, ExecutorActionKind, FinalValidation,
    HelperDecision, HelperVerdict, PlanRoute, QueryAnalysis, StrategicPlan, SynthesisOut,
    ValidationDecision,
};
use super::session_lock::TurnPermit;
use super::stages::PromptSection;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, serde::Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
    pub phase_reached: TurnPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_results: Option<String>,
}

/// What `handle_message` did with an inbound message.
pub enum HandleResult {
    /// A turn was active; the message became an intervention.
    Injected(InterventionKind),
    /// A full turn ran.
    Completed(Box<TurnOutcome>),
}

/// Internal pipeline termination.
enum PipelineEnd {
    Approved { response: String },
    Clarified { question: String },
    Cancelled(TurnOutcome),
    /// Stage-helper double failure or a validator FAIL (incl. promoted).
    ValidationFailed { reason: String },
}

const GENERIC_FAILURE: &str = "I encountered an error and couldn't finish this request.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle one inbound message: start a turn, or deliver it to the running
/// turn's intervention queue.
pub async fn handle_message(
    state: &AppState,
    session_id: &str,
    text: &str,
    mode: Mode,
) -> HandleResult {
    if !state.session_locks.try_begin(session_id) {
        let kind = state.interventions.inject(session_id, text);
        tracing::info!(session = session_id, kind = ?kind, "message routed to intervention queue");
        return HandleResult::Injected(kind);
    }

    // Finalizer: releases the lock and closes the intervention window on
    // every exit path.
    let _permit = TurnPermit::new(
        state.session_locks.clone(),
        state.interventions.clone(),
        session_id,
    );

    let span = tracing::info_span!("turn", session = session_id, mode = mode.as_str());
    let outcome = tracing::Instrument::instrument(run_turn(state, session_id, text, mode), span).await;
    HandleResult::Completed(Box::new(outcome))
}

async fn run_turn(state: &AppState, session_id: &str, text: &str, mode: Mode) -> TurnOutcome {
    let turn_number = match state.turns.next_turn_number(session_id) {
        Ok(n) => n,
        Err(e) => return internal_failure(state, session_id, TurnPhase::Init, &e),
    };
    if let Err(e) = state.turns.ensure_user_dirs(session_id) {
        return internal_failure(state, session_id, TurnPhase::Init, &e);
    }

    let tid = turn_id(turn_number);
    state.interventions.begin_turn(session_id, &tid);

    let mut run = TurnRun {
        state,
        session_id: session_id.to_string(),
        mode,
        turn_number,
        query: text.to_string(),
        doc: TurnDocument::new(&tid, session_id, mode),
        metrics: TurnMetrics::default(),
        phase: TurnPhase::Init,
        guidance: Vec::new(),
        analysis: QueryAnalysis::default(),
        last_synthesis: None,
        claims: Vec::new(),
        workflows_used: Vec::new(),
        tool_results_md: String::new(),
        quality_score: 0.0,
        context_rounds: 0,
    };

    let end = run.pipeline().await;
    let outcome = match end {
        Ok(PipelineEnd::Approved { response }) => TurnOutcome {
            response,
            status: TurnStatus::Ok,
            error_type: None,
            phase_reached: run.phase,
            partial_results: None,
        },
        Ok(PipelineEnd::Clarified { question }) => TurnOutcome {
            response: question,
            status: TurnStatus::Ok,
            error_type: None,
            phase_reached: run.phase,
            partial_results: None,
        },
        Ok(PipelineEnd::Cancelled(outcome)) => outcome,
        Ok(PipelineEnd::ValidationFailed { reason }) => {
            run.metrics.validation_outcome = Some("FAIL".into());
            TurnOutcome {
                response: GENERIC_FAILURE.to_string(),
                status: TurnStatus::Failed,
                error_type: None,
                phase_reached: run.phase,
                partial_results: Some(reason),
            }
        }
        Err(e) => {
            tracing::error!(error = %e, phase = ?run.phase, "turn halted");
            state
                .interventions
                .record_error(session_id, e.kind(), &e.to_string());
            TurnOutcome {
                response: GENERIC_FAILURE.to_string(),
                status: TurnStatus::Failed,
                error_type: Some(e.kind()),
                phase_reached: run.phase,
                partial_results: None,
            }
        }
    };

    // Persist. Every write failure halts (fail-fast), downgrading the
    // outcome to failed.
    run.phase = TurnPhase::Save;
    if let Err(e) = save::save_turn(state, &mut run, &outcome).await {
        tracing::error!(error = %e, "save pipeline failed");
        state
            .interventions
            .record_error(session_id, e.kind(), &e.to_string());
        return TurnOutcome {
            response: GENERIC_FAILURE.to_string(),
            status: TurnStatus::Failed,
            error_type: Some(e.kind()),
            phase_reached: TurnPhase::Save,
            partial_results: None,
        };
    }

    outcome
}

fn internal_failure(
    state: &AppState,
    session_id: &str,
    phase: TurnPhase,
    error: &Error,
) -> TurnOutcome {
    state
        .interventions
        .record_error(session_id, error.kind(), &error.to_string());
    TurnOutcome {
        response: GENERIC_FAILURE.to_string(),
        status: TurnStatus::Failed,
        error_type: Some(error.kind()),
        phase_reached: phase,
        partial_results: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnRun — per-turn mutable state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct TurnRun<'a> {
    state: &'a AppState,
    pub session_id: String,
    pub mode: Mode,
    pub turn_number: u64,
    pub query: String,
    pub doc: TurnDocument,
    pub metrics: TurnMetrics,
    phase: TurnPhase,
    /// Unapplied guidance from interventions.
    guidance: Vec<GuidanceAdjustment>,
    pub analysis: QueryAnalysis,
    last_synthesis: Option<SynthesisOut>,
    pub claims: Vec<Claim>,
    pub workflows_used: Vec<String>,
    pub tool_results_md: String,
    pub quality_score: f64,
    /// How many context-gathering rounds have written §2 entries.
    context_rounds: usize,
}

impl<'a> TurnRun<'a> {
    fn enter(&mut self, phase: TurnPhase) {
        self.phase = phase;
        self.state.interventions.set_phase(&self.session_id, phase);
    }

    fn decision(&mut self, text: String) {
        self.metrics.decisions.push(text);
    }

    /// Poll the intervention queue. Guidance accumulates; cancellation
    /// produces a phase-appropriate abort outcome.
    fn check_injections(&mut self) -> Option<PipelineEnd> {
        let poll = self.state.interventions.poll(&self.session_id);
        self.guidance.extend(poll.guidance);
        if !poll.cancelled {
            return None;
        }
        Some(PipelineEnd::Cancelled(self.cancel_outcome()))
    }

    fn cancel_outcome(&self) -> TurnOutcome {
        let stage = self.phase.stage_number();
        if stage >= 6 {
            if let Some(synthesis) = &self.last_synthesis {
                return TurnOutcome {
                    response: synthesis.response.clone(),
                    status: TurnStatus::CancelledPartial,
                    error_type: None,
                    phase_reached: self.phase,
                    partial_results: Some("cancelled during validation".into()),
                };
            }
        }
        if stage >= 4 && !self.doc.entries(4).is_empty() {
            let partial = self.format_partial_progress();
            return TurnOutcome {
                response: partial.clone(),
                status: TurnStatus::CancelledPartial,
                error_type: None,
                phase_reached: self.phase,
                partial_results: Some(partial),
            };
        }
        TurnOutcome {
            response: String::new(),
            status: TurnStatus::Cancelled,
            error_type: None,
            phase_reached: self.phase,
            partial_results: None,
        }
    }

    /// Render accumulated §4 progress as a partial answer.
    fn format_partial_progress(&self) -> String {
        let mut out = String::from("The request was cancelled mid-way. Progress so far:\n");
        for entry in self.doc.entries(4) {
            if let Some(label) = &entry.label {
                out.push_str(&format!("\n— {label} —\n"));
            }
            out.push_str(entry.body.trim());
            out.push('\n');
        }
        out
    }

    /// Drain pending guidance into a `[USER INJECTION]` block.
    fn drain_guidance_block(&mut self) -> Option<String> {
        if self.guidance.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .guidance
            .drain(..)
            .map(|g| match g {
                GuidanceAdjustment::SkipVendor { target } => format!("skip vendor: {target}"),
                GuidanceAdjustment::FocusQuery { target } => format!("focus on: {target}"),
                GuidanceAdjustment::AddVendor { target } => format!("also check: {target}"),
                GuidanceAdjustment::Guidance { text } => text,
            })
            .collect();
        Some(format!("[USER INJECTION] {}", lines.join("; ")))
    }

    // ──────────────────────────────────────────────────────────────
    // The pipeline
    // ──────────────────────────────────────────────────────────────

    async fn pipeline(&mut self) -> Result<PipelineEnd> {
        // ── Stage 1 + 1.5: analysis with one validated retry ──────
        self.enter(TurnPhase::Analyze);
        if let Some(end) = self.check_injections() {
            return Ok(end);
        }

        let mut analysis = self.stage_analyze(None).await?;
        self.enter(TurnPhase::ValidateAnalysis);
        if let Some(end) = self.check_injections() {
            return Ok(end);
        }
        let mut verdict = self.stage_validate_analysis(&analysis).await?;
        self.write_validation_section(&verdict, 1)?;
        self.decision(format!("validate_analysis: {:?}", verdict.decision));

        let mut stage_retries = 0;
        while verdict.decision == HelperDecision::Retry {
            if stage_retries >= self.state.config.orchestrator.max_stage_retry {
                return Ok(PipelineEnd::ValidationFailed {
                    reason: "query analysis failed validation twice".into(),
                });
            }
            stage_retries += 1;
            self.enter(TurnPhase::Analyze);
            if let Some(end) = self.check_injections() {
                return Ok(end);
            }
            analysis = self.stage_analyze(Some(&verdict)).await?;
            self.enter(TurnPhase::ValidateAnalysis);
            verdict = self.stage_validate_analysis(&analysis).await?;
            self.write_validation_section(&verdict, 1 + stage_retries as usize)?;
            self.decision(format!("validate_analysis: {:?}", verdict.decision));
        }
        if verdict.decision == HelperDecision::Clarify {
            let question = verdict
                .clarification
                .unwrap_or_else(|| "Could you clarify what you're looking for?".into());
            return Ok(PipelineEnd::Clarified { question });
        }

        // §0 is written once analysis holds: raw query + derived fields.
        self.write_query_section(&analysis)?;
        self.analysis = analysis;

        // ── Stage 2.1 + 2.2 + 2.5: context with one validated retry ──
        let mut context_retries = 0;
        loop {
            self.enter(TurnPhase::Retrieve);
            if let Some(end) = self.check_injections() {
                return Ok(end);
            }
            let results = self.retrieve(&[]).await?;

            self.enter(TurnPhase::SynthesizeContext);
            if let Some(end) = self.check_injections() {
                return Ok(end);
            }
            let synthesis = self.stage_synthesize_context(&results).await?;
            self.write_context_sections(&results, &synthesis)?;

            self.enter(TurnPhase::ValidateContext);
            if let Some(end) = self.check_injections() {
                return Ok(end);
            }
            let verdict = self.stage_validate_context().await?;
            self.decision(format!("validate_context: {:?}", verdict.decision));
            match verdict.decision {
                HelperDecision::Pass => break,
                HelperDecision::Clarify => {
                    let question = verdict
                        .clarification
                        .unwrap_or_else(|| "Could you clarify what you're looking for?".into());
                    return Ok(PipelineEnd::Clarified { question });
                }
                HelperDecision::Retry => {
                    if context_retries >= self.state.config.orchestrator.max_stage_retry {
                        return Ok(PipelineEnd::ValidationFailed {
                            reason: "context gathering failed validation twice".into(),
                        });
                    }
                    context_retries += 1;
                }
            }
        }

        // ── Stages 3..7 with the validation-driven retry loop ─────
        let caps = self.state.config.orchestrator;
        let mut revises = 0u32;
        let mut retries = 0u32;
        let mut suggested_fixes: Vec<String> = Vec::new();

        'attempts: loop {
            let attempt = retries + 1;

            let termination_reason = match self.plan_and_execute(attempt, &suggested_fixes).await? {
                PlanExecuteEnd::Continue { termination_reason } => termination_reason,
                PlanExecuteEnd::End(end) => return Ok(end),
            };

            let mut revision_hints: Vec<String> = Vec::new();
            loop {
                self.enter(TurnPhase::Synthesize);
                if let Some(end) = self.check_injections() {
                    return Ok(end);
                }
                let synthesis = self
                    .stage_synthesize(&revision_hints, termination_reason.as_deref())
                    .await?;
                self.write_synthesis_section(&synthesis)?;
                self.last_synthesis = Some(synthesis.clone());

                self.enter(TurnPhase::Validate);
                if let Some(end) = self.check_injections() {
                    return Ok(end);
                }
                let validation = self.stage_validate(&synthesis).await?;
                self.write_final_validation_section(&validation)?;
                self.decision(format!(
                    "validate: {}({:.2})",
                    validation.decision.as_str(),
                    validation.confidence
                ));
                self.quality_score = validation.confidence;

                match validation.decision {
                    ValidationDecision::Approve => {
                        self.metrics.validation_outcome = Some("APPROVE".into());
                        return Ok(PipelineEnd::Approved {
                            response: synthesis.response,
                        });
                    }
                    ValidationDecision::Revise if revises < caps.max_revise => {
                        revises += 1;
                        revision_hints = validation.revision_hints;
                        continue;
                    }
                    ValidationDecision::Retry if retries < caps.max_retry => {
                        retries += 1;
                        suggested_fixes = validation.suggested_fixes;
                        continue 'attempts;
                    }
                    // FAIL, or a cap overflow promoted to FAIL.
                    decision => {
                        let promoted = decision != ValidationDecision::Fail;
                        if promoted {
                            self.decision(format!(
                                "validation cap exceeded; {} promoted to FAIL",
                                decision.as_str()
                            ));
                        }
                        self.metrics.validation_outcome = Some("FAIL".into());
                        return Ok(PipelineEnd::ValidationFailed {
                            reason: if promoted {
                                format!("{} cap exceeded", decision.as_str())
                            } else {
                                "validator rejected the response".into()
                            },
                        });
                    }
                }
            }
        }
    }

    /// Stage 3 (with refresh_context loop) and the Executor–Coordinator
    /// loop when routed there.
    async fn plan_and_execute(
        &mut self,
        attempt: u32,
        suggested_fixes: &[String],
    ) -> Result<PlanExecuteEnd> {
        let caps = self.state.config.orchestrator;
        let mut refreshes = 0u32;

        let plan = loop {
            self.enter(TurnPhase::Plan);
            if let Some(end) = self.check_injections() {
                return Ok(PlanExecuteEnd::End(end));
            }
            let plan = self.stage_plan(attempt, refreshes, suggested_fixes).await?;
            self.decision(format!("plan: {:?}", plan.route));

            match plan.route {
                PlanRoute::RefreshContext if refreshes < caps.max_context_refresh => {
                    refreshes += 1;
                    self.enter(TurnPhase::Retrieve);
                    if let Some(end) = self.check_injections() {
                        return Ok(PlanExecuteEnd::End(end));
                    }
                    let results = self.retrieve(&plan.missing_items).await?;
                    self.enter(TurnPhase::SynthesizeContext);
                    let synthesis = self.stage_synthesize_context(&results).await?;
                    self.write_context_sections(&results, &synthesis)?;
                    continue;
                }
                PlanRoute::RefreshContext => {
                    tracing::warn!("planner requested refresh_context beyond cap; synthesizing");
                    self.decision("refresh_context cap exceeded; proceeding to synthesis".into());
                    break StrategicPlan {
                        route: PlanRoute::Synthesis,
                        ..plan
                    };
                }
                _ => break plan,
            }
        };

        match plan.route {
            PlanRoute::Clarify => {
                let question = plan
                    .clarification
                    .unwrap_or_else(|| "Could you clarify what you're looking for?".into());
                Ok(PlanExecuteEnd::End(PipelineEnd::Clarified { question }))
            }
            PlanRoute::Executor => self.executor_loop(&plan, attempt).await,
            _ => Ok(PlanExecuteEnd::Continue {
                termination_reason: None,
            }),
        }
    }

    // ──────────────────────────────────────────────────────────────
    // Executor–Coordinator loop (stages 4/5)
    // ──────────────────────────────────────────────────────────────

    async fn executor_loop(&mut self, plan: &StrategicPlan, attempt: u32) -> Result<PlanExecuteEnd> {
        let caps = self.state.config.orchestrator;
        let mut consecutive_errors = 0u32;
        let mut termination_reason: Option<String> = None;

        for iteration in 1..=caps.max_executor_iterations {
            self.enter(TurnPhase::Execute);
            if let Some(end) = self.check_injections() {
                return Ok(PlanExecuteEnd::End(end));
            }
            let injection_block = self.drain_guidance_block();

            let action = self
                .stage_executor(plan, attempt, iteration, injection_block.as_deref())
                .await?;
            let label = format!("Attempt {attempt} — Iteration {iteration}");

            match action.action {
                ExecutorActionKind::Complete => {
                    self.decision(format!("executor[{iteration}]: COMPLETE"));
                    return Ok(PlanExecuteEnd::Continue {
                        termination_reason: None,
                    });
                }
                ExecutorActionKind::Blocked => {
                    let reason = action.reason.unwrap_or_else(|| "blocked".into());
                    self.decision(format!("executor[{iteration}]: BLOCKED ({reason})"));
                    self.doc.append_simple(
                        4,
                        Some(label),
                        format!("**Blocked:** {reason}"),
                    )?;
                    termination_reason = Some(reason);
                    break;
                }
                ExecutorActionKind::Analyze => {
                    let analysis = action.analysis.unwrap_or_default();
                    self.decision(format!("executor[{iteration}]: ANALYZE"));
                    self.doc
                        .append_simple(4, Some(label), format!("**Analysis:** {analysis}"))?;
                }
                ExecutorActionKind::Command => {
                    let command = action.command.unwrap_or_default();
                    if command.trim().is_empty() {
                        return Err(Error::Schema {
                            schema: "executor_action".into(),
                            message: "COMMAND action without a command".into(),
                        });
                    }
                    self.decision(format!("executor[{iteration}]: COMMAND"));

                    // Stage 5: coordinator translation.
                    let translation = self.stage_coordinator(&command).await?;
                    self.doc.append_simple(
                        5,
                        Some(label.clone()),
                        format!(
                            "**Command:** {command}\n**Translated to:** {}",
                            translation
                                .tool
                                .clone()
                                .unwrap_or_else(|| "(workflow match)".into())
                        ),
                    )?;

                    // Check cancellation before the tool runs; an in-flight
                    // tool is never aborted.
                    if let Some(end) = self.check_injections() {
                        return Ok(PlanExecuteEnd::End(end));
                    }

                    let outcome = self
                        .state
                        .executor
                        .execute(
                            &command,
                            translation.intent.as_deref(),
                            translation
                                .tool
                                .as_deref()
                                .map(|t| (t, translation.args.clone())),
                            self.mode,
                            &self.session_id,
                        )
                        .await?;

                    if outcome.was_workflow {
                        self.workflows_used.push(outcome.invoked.clone());
                    }
                    self.metrics.tools_used.push(outcome.invoked.clone());
                    self.claims.extend(outcome.claims.clone());
                    if let Some(raw) = &outcome.raw_result {
                        self.tool_results_md.push_str(&format!(
                            "## {label}: {}\n```json\n{}\n```\n\n",
                            outcome.invoked,
                            serde_json::to_string_pretty(raw).unwrap_or_default()
                        ));
                    }
                    self.doc
                        .append_simple(4, Some(label), execution_block(&command, &outcome))?;

                    match outcome.status {
                        ExecutionStatus::Failed => {
                            consecutive_errors += 1;
                            if consecutive_errors >= caps.max_consecutive_tool_errors {
                                termination_reason = Some(format!(
                                    "{consecutive_errors} consecutive tool errors"
                                ));
                                self.decision("executor loop: consecutive tool errors".into());
                                break;
                            }
                        }
                        _ => consecutive_errors = 0,
                    }
                }
            }

            if iteration == caps.max_executor_iterations {
                termination_reason = Some(format!(
                    "iteration limit reached ({} iterations)",
                    caps.max_executor_iterations
                ));
                self.decision("executor loop: iteration limit".into());
            }
        }

        Ok(PlanExecuteEnd::Continue { termination_reason })
    }

    // ──────────────────────────────────────────────────────────────
    // Individual stages
    // ──────────────────────────────────────────────────────────────

    async fn stage_analyze(&mut self, feedback: Option<&HelperVerdict>) -> Result<QueryAnalysis> {
        let mut sections = vec![PromptSection::protected(
            "Query",
            &format!("{} (mode: {})", self.query, self.mode.as_str()),
        )];
        if let Some(verdict) = feedback {
            sections.push(PromptSection::new(
                "Validator Feedback",
                &format!(
                    "Issues: {}\nGuidance: {}",
                    verdict.issues.join("; "),
                    verdict.retry_guidance.join("; ")
                ),
                1,
                1.0,
                u32::MAX,
            ));
        }
        let out = self
            .state
            .stages
            .run_stage(
                StageName::Analyze,
                &sections,
                "Analyze the query above.",
                &query_analysis_schema(),
            )
            .await?;
        self.metrics.stages.push(out.metric);
        QueryAnalysis::from_value(out.value)
    }

    async fn stage_validate_analysis(&mut self, analysis: &QueryAnalysis) -> Result<HelperVerdict> {
        let sections = vec![
            PromptSection::protected("Query", &self.query),
            PromptSection::new(
                "Query Analysis",
                &serde_json::to_string_pretty(analysis)?,
                1,
                1.0,
                u32::MAX,
            ),
        ];
        let out = self
            .state
            .stages
            .run_stage(
                StageName::ValidateAnalysis,
                &sections,
                "Validate the analysis against the query.",
                &helper_verdict_schema(),
            )
            .await?;
        self.metrics.stages.push(out.metric);
        HelperVerdict::from_value(out.value)
    }

    async fn retrieve(&mut self, missing_items: &[String]) -> Result<SearchResults> {
        let mut retriever = MemoryRetriever::build(
            &self.session_id,
            &self.state.turns,
            &self.state.knowledge,
            self.state.stages.router(),
            self.state.config.memory.clone(),
        )?;
        retriever.index_embeddings().await;

        let mut purpose = self.analysis.user_purpose.clone();
        if !missing_items.is_empty() {
            purpose.push_str(&format!("; missing: {}", missing_items.join(", ")));
        }
        let opts = RetrieveOptions {
            previous_turn: (self.turn_number > 1).then(|| self.turn_number - 1),
            referenced_turns: self.analysis.referenced_turns.clone(),
        };
        let results = retriever.retrieve(&self.query, &purpose, &opts).await?;
        // The term-generation call is an LLM call like any other: it gets
        // a stage entry in the turn's metrics.
        self.metrics.stages.push(cox_store::StageMetric {
            stage: StageName::SearchTerms.as_str().to_string(),
            duration_ms: 0,
            tokens_in: results.stats.term_gen_tokens_in,
            tokens_out: results.stats.term_gen_tokens_out,
            parse_strategy: results
                .stats
                .degraded_term_generation
                .then(|| "keyword_fallback".to_string()),
        });
        self.decision(format!(
            "retrieve: {} hits ({} dropped below floor)",
            results.hits.len(),
            results.stats.dropped_below_floor
        ));
        Ok(results)
    }

    async fn stage_synthesize_context(
        &mut self,
        results: &SearchResults,
    ) -> Result<ContextSynthesis> {
        if results.hits.is_empty() {
            // Zero-node scaffold: nothing to call the model about.
            return Ok(ContextSynthesis {
                summary: "(no stored context matched this query)".into(),
                gaps: Vec::new(),
            });
        }

        let mut listing = String::new();
        for hit in &results.hits {
            listing.push_str(&format!(
                "- [{}] {} (confidence {:.2}): {}\n",
                hit.source_type.as_str(),
                hit.document_path,
                hit.confidence,
                hit.snippet
            ));
        }
        let sections = vec![
            PromptSection::protected("Query", &self.query),
            PromptSection::new("Retrieved Context", &listing, 1, 0.8, u32::MAX),
        ];
        let out = self
            .state
            .stages
            .run_stage(
                StageName::SynthesizeContext,
                &sections,
                "Organize the retrieved context for this query.",
                &context_synthesis_schema(),
            )
            .await?;
        self.metrics.stages.push(out.metric);
        ContextSynthesis::from_value(out.value)
    }

    async fn stage_validate_context(&mut self) -> Result<HelperVerdict> {
        let context_body = self
            .doc
            .entries(2)
            .iter()
            .map(|e| e.body.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let sections = vec![
            PromptSection::protected("Query", &self.query),
            PromptSection::new("Gathered Context", &context_body, 1, 0.8, u32::MAX),
        ];
        let out = self
            .state
            .stages
            .run_stage(
                StageName::ValidateContext,
                &sections,
                "Is this context sufficient and relevant for the query?",
                &helper_verdict_schema(),
            )
            .await?;
        self.metrics.stages.push(out.metric);
        HelperVerdict::from_value(out.value)
    }

    async fn stage_plan(
        &mut self,
        attempt: u32,
        refreshes: u32,
        suggested_fixes: &[String],
    ) -> Result<StrategicPlan> {
        let mut sections = vec![PromptSection::protected(
            "Query",
            &self
                .doc
                .latest(0)
                .map(|e| e.body.clone())
                .unwrap_or_else(|| self.query.clone()),
        )];

        let context_body = self
            .doc
            .entries(2)
            .iter()
            .map(|e| e.body.clone())
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(PromptSection::new("Gathered Context", &context_body, 1, 0.8, 2));

        // Evidence for the stale-research call: cached research quality
        // rides along and the planner owns the route decision.
        if let Ok(entries) = self
            .state
            .research_index
            .lookup(&self.analysis.topic, Utc::now())
        {
            if !entries.is_empty() {
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| {
                        format!(
                            "- {} quality {:.2}, expires {}",
                            e.primary_topic, e.quality_score, e.expires_at
                        )
                    })
                    .collect();
                sections.push(PromptSection::new(
                    "Cached Research Quality",
                    &lines.join("\n"),
                    2,
                    0.7,
                    1,
                ));
            }
        }

        if let Some(block) = self.drain_guidance_block() {
            sections.push(PromptSection::new("User Guidance", &block, 1, 1.0, u32::MAX));
        }
        if !suggested_fixes.is_empty() {
            sections.push(PromptSection::new(
                "Validator Fixes",
                &suggested_fixes.join("\n"),
                1,
                1.0,
                u32::MAX,
            ));
        }

        let out = self
            .state
            .stages
            .run_stage(
                StageName::Plan,
                &sections,
                "Produce the strategic plan.",
                &strategic_plan_schema(),
            )
            .await?;
        self.metrics.stages.push(out.metric);
        let plan = StrategicPlan::from_value(out.value)?;

        // §3 — one entry per (attempt, refresh) pair.
        let label = if attempt > 1 || refreshes > 0 {
            Some(format!("Attempt {attempt}.{refreshes}"))
        } else {
            None
        };
        let goals = plan
            .goals
            .iter()
            .map(|g| {
                format!(
                    "- [{}] {} (priority {}{})",
                    g.id,
                    g.description,
                    g.priority,
                    if g.depends_on.is_empty() {
                        String::new()
                    } else {
                        format!(", after {}", g.depends_on.join(", "))
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.doc.append_simple(
            3,
            label,
            format!(
                "**Route:** {:?}\n**Approach:** {}\n**Goals:**\n{}\n**Success criteria:**\n{}",
                plan.route,
                plan.approach,
                goals,
                plan.success_criteria.join("\n")
            ),
        )?;
        Ok(plan)
    }

    async fn stage_executor(
        &mut self,
        plan: &StrategicPlan,
        attempt: u32,
        iteration: u32,
        injection: Option<&str>,
    ) -> Result<ExecutorAction> {
        let progress = self
            .doc
            .entries(4)
            .iter()
            .map(|e| {
                format!(
                    "{}\n{}",
                    e.label.clone().unwrap_or_default(),
                    e.body
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n");

        let plan_body = self
            .doc
            .latest(3)
            .map(|e| e.body.clone())
            .unwrap_or_default();

        let mut sections = vec![
            PromptSection::protected("Query", &self.query),
            PromptSection::new("Strategic Plan", &plan_body, 1, 1.0, 3),
            PromptSection::new("Execution Progress", &progress, 1, 1.0, 4),
        ];
        let mut input = format!(
            "Attempt {attempt}, iteration {iteration}. Decide the next step toward: {}",
            plan.approach
        );
        if let Some(injection) = injection {
            // User guidance leads the executor input.
            input = format!("{injection}\n{input}");
        }

        sections.push(PromptSection::new(
            "Remaining Iterations",
            &format!(
                "{} of {}",
                self.state.config.orchestrator.max_executor_iterations - iteration + 1,
                self.state.config.orchestrator.max_executor_iterations
            ),
            2,
            1.0,
            5,
        ));

        let out = self
            .state
            .stages
            .run_stage(StageName::Executor, &sections, &input, &executor_action_schema())
            .await?;
        self.metrics.stages.push(out.metric);
        ExecutorAction::from_value(out.value)
    }

    async fn stage_coordinator(&mut self, command: &str) -> Result<CoordinatorTranslation> {
        let workflows = self
            .state
            .executor
            .registry()
            .list()
            .into_iter()
            .map(|w| format!("- {} ({})", w.name, w.category))
            .collect::<Vec<_>>()
            .join("\n");
        let sections = vec![PromptSection::new(
            "Available Workflows",
            &workflows,
            2,
            1.0,
            1,
        )];
        let out = self
            .state
            .stages
            .run_stage(
                StageName::Coordinator,
                &sections,
                &format!("Translate into one tool invocation: {command}"),
                &coordinator_schema(),
            )
            .await?;
        self.metrics.stages.push(out.metric);
        CoordinatorTranslation::from_value(out.value)
    }

    async fn stage_synthesize(
        &mut self,
        revision_hints: &[String],
        termination_reason: Option<&str>,
    ) -> Result<SynthesisOut> {
        let context_body = self
            .doc
            .entries(2)
            .iter()
            .map(|e| e.body.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let progress = self
            .doc
            .entries(4)
            .iter()
            .map(|e| e.body.clone())
            .collect::<Vec<_>>()
            .join("\n---\n");

        let mut sections = vec![
            PromptSection::protected(
                "Query",
                &self
                    .doc
                    .latest(0)
                    .map(|e| e.body.clone())
                    .unwrap_or_else(|| self.query.clone()),
            ),
            PromptSection::new("Gathered Context", &context_body, 1, 0.8, 2),
        ];
        if !progress.is_empty() {
            sections.push(PromptSection::new("Execution Progress", &progress, 1, 1.0, 3));
        }
        if let Some(reason) = termination_reason {
            sections.push(PromptSection::new(
                "Termination Reason",
                &format!(
                    "Execution stopped early: {reason}. Acknowledge what is incomplete."
                ),
                1,
                1.0,
                u32::MAX,
            ));
        }
        if !revision_hints.is_empty() {
            sections.push(PromptSection::new(
                "Revision Hints",
                &revision_hints.join("\n"),
                1,
                1.0,
                u32::MAX,
            ));
        }

        let out = self
            .state
            .stages
            .run_stage(
                StageName::Synthesize,
                &sections,
                "Write the final user-facing response.",
                &synthesis_schema(),
            )
            .await?;
        self.metrics.stages.push(out.metric);
        SynthesisOut::from_value(out.value)
    }

    async fn stage_validate(&mut self, synthesis: &SynthesisOut) -> Result<FinalValidation> {
        let support = self
            .doc
            .entries(2)
            .iter()
            .chain(self.doc.entries(4).iter())
            .map(|e| e.body.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let sections = vec![
            PromptSection::protected("Query", &self.query),
            PromptSection::new("Evidence", &support, 1, 0.9, 2),
            PromptSection::new("Candidate Response", &synthesis.response, 1, 1.0, 3),
        ];
        let out = self
            .state
            .stages
            .run_stage(
                StageName::Validate,
                &sections,
                "Validate the candidate response against the evidence.",
                &final_validation_schema(),
            )
            .await?;
        self.metrics.stages.push(out.metric);
        FinalValidation::from_value(out.value)
    }

    // ──────────────────────────────────────────────────────────────
    // Section writers
    // ──────────────────────────────────────────────────────────────

    fn write_query_section(&mut self, analysis: &QueryAnalysis) -> Result<()> {
        let query = QuerySection {
            raw_text: self.query.clone(),
            mode: self.mode,
            arrived_at: self.doc.created_at,
            user_purpose: Some(analysis.user_purpose.clone()),
            data_requirements: analysis.data_requirements.clone(),
            reference_status: if analysis.referenced_turns.is_empty() {
                ReferenceStatus::None
            } else {
                ReferenceStatus::Resolved
            },
            referenced_turns: analysis.referenced_turns.iter().map(|n| turn_id(*n)).collect(),
        };
        let body = format!(
            "**Raw query:** {}\n**Mode:** {}\n**Arrived:** {}\n**Purpose:** {}\n\
             **Data requirements:** prices={}, availability={}, web={}\n\
             **References:** {:?} {}",
            query.raw_text,
            query.mode.as_str(),
            query.arrived_at.to_rfc3339(),
            query.user_purpose.as_deref().unwrap_or("-"),
            query.data_requirements.needs_current_prices,
            query.data_requirements.needs_availability,
            query.data_requirements.needs_web_research,
            query.reference_status,
            query.referenced_turns.join(", ")
        );
        self.doc.append_simple(0, None, body)
    }

    fn write_validation_section(&mut self, verdict: &HelperVerdict, attempt: usize) -> Result<()> {
        let label = (attempt > 1).then(|| format!("Attempt {attempt}"));
        self.doc.append_simple(
            1,
            label,
            format!(
                "**Decision:** {:?}\n**Issues:** {}\n**Retry guidance:** {}",
                verdict.decision,
                verdict.issues.join("; "),
                verdict.retry_guidance.join("; ")
            ),
        )
    }

    fn write_context_sections(
        &mut self,
        results: &SearchResults,
        synthesis: &ContextSynthesis,
    ) -> Result<()> {
        let round = self.context_rounds;
        self.context_rounds += 1;
        let suffix = move |base: &str| {
            if round > 0 {
                format!("{base} (round {round})")
            } else {
                base.to_string()
            }
        };

        if results.hits.is_empty() {
            self.doc.append_simple(
                2,
                Some(suffix("empty")),
                "(no stored context matched this query)".into(),
            )?;
            return Ok(());
        }

        // One §2 entry per source type, each carrying its own _meta.
        let mut by_type: Vec<(&str, Vec<&SearchHit>)> = Vec::new();
        for hit in &results.hits {
            let key = hit.source_type.as_str();
            match by_type.iter_mut().find(|(k, _)| *k == key) {
                Some((_, hits)) => hits.push(hit),
                None => by_type.push((key, vec![hit])),
            }
        }

        for (source_type, hits) in by_type {
            let confidence_avg =
                hits.iter().map(|h| h.confidence).sum::<f64>() / hits.len() as f64;
            let meta = SectionMeta {
                source_type: source_type.to_string(),
                node_ids: hits.iter().map(|h| h.node_id.clone()).collect(),
                confidence_avg: (confidence_avg * 100.0).round() / 100.0,
                provenance: hits.iter().map(|h| h.document_path.clone()).collect(),
            };
            let body = hits
                .iter()
                .map(|h| format!("- {}", h.snippet))
                .collect::<Vec<_>>()
                .join("\n");
            self.doc.append(SectionEntry {
                number: 2,
                title: section_title(2).to_string(),
                label: Some(suffix(source_type)),
                meta: Some(meta),
                body,
            })?;
        }

        self.doc.append_simple(
            2,
            Some(suffix("synthesis")),
            format!(
                "{}\n\n**Gaps:** {}",
                synthesis.summary,
                if synthesis.gaps.is_empty() {
                    "none identified".to_string()
                } else {
                    synthesis.gaps.join("; ")
                }
            ),
        )
    }

    fn write_synthesis_section(&mut self, synthesis: &SynthesisOut) -> Result<()> {
        let attempt = self.doc.entry_count(6) + 1;
        let label = (attempt > 1).then(|| format!("Attempt {attempt}"));
        let checklist = synthesis
            .checklist
            .iter()
            .map(|c| format!("- [x] {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.doc.append_simple(
            6,
            label,
            format!("**Response preview:**\n{}\n\n**Checklist:**\n{}", synthesis.response, checklist),
        )
    }

    fn write_final_validation_section(&mut self, validation: &FinalValidation) -> Result<()> {
        let attempt = self.doc.entry_count(7) + 1;
        let label = (attempt > 1).then(|| format!("Attempt {attempt}"));
        let checks = validation
            .checks
            .iter()
            .map(|(name, value)| format!("- {name}: {value}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.doc.append_simple(
            7,
            label,
            format!(
                "**Decision:** {}\n**Confidence:** {:.2}\n**Checks:**\n{}\n\
                 **Revision hints:** {}\n**Suggested fixes:** {}",
                validation.decision.as_str(),
                validation.confidence,
                checks,
                validation.revision_hints.join("; "),
                validation.suggested_fixes.join("; ")
            ),
        )
    }
}

enum PlanExecuteEnd {
    Continue { termination_reason: Option<String> },
    End(PipelineEnd),
}

/// Format one executed command as a §4 block: command, tool, args, status,
/// result summary, and the extracted claims table.
fn execution_block(command: &str, outcome: &cox_tools::ExecutionOutcome) -> String {
    let mut block = format!(
        "**Command:** {command}\n**Tool:** {}{}\n**Args:** {}\n**Status:** {}\n**Result:** {}",
        outcome.invoked,
        if outcome.was_workflow { " (workflow)" } else { "" },
        serde_json::to_string(&outcome.args).unwrap_or_default(),
        match outcome.status {
            ExecutionStatus::Ok => "ok",
            ExecutionStatus::Blocked => "blocked",
            ExecutionStatus::Failed => "failed",
        },
        outcome.result_summary
    );
    if !outcome.claims.is_empty() {
        block.push_str("\n\n");
        block.push_str(Claim::table_header());
        for claim in &outcome.claims {
            block.push('\n');
            block.push_str(&claim.to_table_row());
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_block_renders_claims_table() {
        let outcome = cox_tools::ExecutionOutcome {
            status: ExecutionStatus::Ok,
            invoked: "internet.research".into(),
            was_workflow: true,
            args: serde_json::json!({"query": "laptops"}),
            result_summary: "3 results".into(),
            claims: vec![Claim {
                text: "Acer Nitro V at $849".into(),
                confidence: 0.9,
                source: "https://shop.example/acer".into(),
                ttl_secs: Some(86_400),
            }],
            raw_result: None,
        };
        let block = execution_block("research laptops", &outcome);
        assert!(block.contains("**Tool:** internet.research (workflow)"));
        assert!(block.contains("**Status:** ok"));
        assert!(block.contains("| claim | confidence | source | ttl |"));
        assert!(block.contains("https://shop.example/acer"));
    }

    #[test]
    fn blocked_outcome_renders_without_claims() {
        let outcome = cox_tools::ExecutionOutcome {
            status: ExecutionStatus::Blocked,
            invoked: "file.edit".into(),
            was_workflow: false,
            args: serde_json::json!({"path": "auth.py"}),
            result_summary: "file.edit requires code mode".into(),
            claims: vec![],
            raw_result: None,
        };
        let block = execution_block("edit auth.py", &outcome);
        assert!(block.contains("**Status:** blocked"));
        assert!(!block.contains("| claim |"));
    }
}
