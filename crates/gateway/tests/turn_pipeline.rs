//! End-to-end turn scenarios against a scripted provider and a scripted
//! tool transport: greeting fast-path, commerce research, mode violation,
//! the validation retry loop, mid-turn cancellation, and the reflector's
//! staging/promotion cycle.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;

use cox_domain::config::Config;
use cox_domain::error::{Error, ErrorKind, Result};
use cox_domain::intervention::InterventionKind;
use cox_domain::turn::{Mode, TurnStatus};
use cox_gateway::runtime::{handle_message, HandleResult, TurnOutcome};
use cox_gateway::state::AppState;
use cox_providers::{
    ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider, Usage,
};
use cox_tools::ToolTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fakes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ScriptedProvider {
    script: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
        })
    }

    fn push(&self, response: &str) {
        self.script.lock().push_back(response.to_string());
    }

    fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
        let next = self.script.lock().pop_front();
        match next {
            Some(content) => Ok(ChatResponse {
                content,
                usage: Some(Usage {
                    prompt_tokens: 50,
                    completion_tokens: 10,
                    total_tokens: 60,
                }),
                model: "scripted".into(),
                finish_reason: Some("stop".into()),
            }),
            None => Err(Error::Llm("script exhausted".into())),
        }
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        // Embeddings stay down: retrieval runs BM25-only in these tests.
        Err(Error::Llm("embeddings unavailable".into()))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

struct ScriptedTransport {
    calls: Mutex<Vec<(String, Value, Mode)>>,
    results: Value,
    /// When set, the first invocation parks until the test releases it.
    entered: Option<Arc<Semaphore>>,
    release: Option<Arc<Semaphore>>,
}

impl ScriptedTransport {
    fn new(results: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            results,
            entered: None,
            release: None,
        })
    }

    fn gated(results: Value, entered: Arc<Semaphore>, release: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            results,
            entered: Some(entered),
            release: Some(release),
        })
    }
}

#[async_trait]
impl ToolTransport for ScriptedTransport {
    async fn invoke(&self, tool: &str, args: &Value, mode: Mode) -> Result<Value> {
        let first_call = {
            let mut calls = self.calls.lock();
            calls.push((tool.to_string(), args.clone(), mode));
            calls.len() == 1
        };
        if first_call {
            if let (Some(entered), Some(release)) = (&self.entered, &self.release) {
                entered.add_permits(1);
                let permit = release.acquire().await.map_err(|_| Error::Tool {
                    tool: tool.to_string(),
                    message: "gate closed".into(),
                })?;
                permit.forget();
            }
        }
        Ok(self.results.get(tool).cloned().unwrap_or(Value::Null))
    }
}

fn test_config(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.root = root.join("data");
    config.workflows.dir = root.join("workflows");
    config.tools.saved_repo = Some("/repo".into());
    config.tools.approval_timeout_secs = 1;
    config
}

async fn run_one(
    state: &AppState,
    session: &str,
    message: &str,
    mode: Mode,
) -> TurnOutcome {
    match handle_message(state, session, message, mode).await {
        HandleResult::Completed(outcome) => *outcome,
        HandleResult::Injected(kind) => panic!("unexpected injection: {kind:?}"),
    }
}

// ── Script fragments ──────────────────────────────────────────────

const ANALYZE_GREETING: &str = r#"{"user_purpose": "greeting", "data_requirements": {}, "referenced_turns": [], "topic": "greeting", "keywords": ["hello"]}"#;
const ANALYZE_LAPTOPS: &str = r#"{"user_purpose": "find the cheapest nvidia laptop", "data_requirements": {"needs_current_prices": true, "needs_web_research": true}, "referenced_turns": [], "topic": "laptops", "keywords": ["laptop", "nvidia"]}"#;
const PASS: &str = r#"{"decision": "pass"}"#;
const TERMS: &str = r#"{"search_terms": ["laptop", "nvidia"], "include_preferences": false, "include_n_minus_1": false}"#;
const PLAN_SYNTHESIS: &str = r#"{"route": "synthesis", "goals": [], "approach": "answer directly", "success_criteria": []}"#;
const PLAN_EXECUTOR: &str = r#"{"route": "executor", "goals": [{"id": "g1", "description": "research listings", "priority": 1}], "approach": "research then summarize", "success_criteria": ["at least one listing"]}"#;
const EXEC_RESEARCH: &str = r#"{"action": "COMMAND", "command": "research cheapest nvidia laptops"}"#;
const COORD_RESEARCH: &str = r#"{"tool": "internet.research", "args": {"query": "cheapest laptop nvidia gpu", "mode": "commerce"}, "intent": null}"#;
const EXEC_COMPLETE: &str = r#"{"action": "COMPLETE"}"#;
const APPROVE: &str = r#"{"decision": "APPROVE", "confidence": 0.92, "checks": {"claims_supported": true}}"#;
const SUMMARY: &str = r#"{"summary": "Handled the request.", "topic": "laptops", "keywords": ["laptop"], "content_type": "general_fact"}"#;

fn research_results() -> Value {
    serde_json::json!({
        "internet.research": {
            "summary": "2 listings found",
            "claims": [
                {"text": "Acer Nitro V with RTX 4050 at $849", "confidence": 0.9,
                 "source": "https://shop.example/acer-nitro", "ttl": 86400},
                {"text": "Lenovo LOQ with RTX 4060 at $999", "confidence": 0.85,
                 "source": "https://shop.example/lenovo-loq", "ttl": 86400}
            ]
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn greeting_fast_path_skips_executor() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[
        ANALYZE_GREETING,
        PASS, // validate analysis
        r#"{"search_terms": ["hello"], "include_preferences": false, "include_n_minus_1": false}"#,
        PASS, // validate context
        PLAN_SYNTHESIS,
        r#"{"response": "Hello! How can I help you today?", "checklist": ["greeted the user"]}"#,
        APPROVE,
        SUMMARY,
    ]);
    let transport = ScriptedTransport::new(serde_json::json!({}));
    let state = AppState::build(test_config(tmp.path()), provider.clone(), transport.clone()).unwrap();

    let outcome = run_one(&state, "s1", "hello", Mode::Chat).await;

    assert_eq!(outcome.status, TurnStatus::Ok);
    assert!(!outcome.response.is_empty());
    assert_eq!(provider.remaining(), 0);
    // No tool ran, §4 absent.
    assert!(transport.calls.lock().is_empty());
    let context = state.turns.read_context("s1", 1).unwrap();
    assert!(context.entries(4).is_empty());
    assert!(context.latest(0).unwrap().body.contains("hello"));
    assert_eq!(context.appendix.as_deref(), Some("Handled the request."));

    // Sections appear in order in the persisted document.
    let raw = std::fs::read_to_string(
        state.turns.layout().turn_dir("s1", 1).join("context.md"),
    )
    .unwrap();
    let positions: Vec<usize> = ["## 0. ", "## 1. ", "## 2. ", "## 3. ", "## 6. ", "## 7. "]
        .iter()
        .map(|h| raw.find(h).unwrap_or_else(|| panic!("missing header {h}")))
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);

    // The session lock is released.
    assert!(!state.session_locks.is_active("s1"));
}

#[tokio::test]
async fn commerce_research_collects_claims_and_links() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[
        ANALYZE_LAPTOPS,
        PASS,
        TERMS,
        PASS, // validate context
        PLAN_EXECUTOR,
        EXEC_RESEARCH,
        COORD_RESEARCH,
        EXEC_COMPLETE,
        r#"{"response": "The cheapest match is the [Acer Nitro V](https://shop.example/acer-nitro) at $849.", "checklist": ["price cited"]}"#,
        APPROVE,
        SUMMARY,
    ]);
    let transport = ScriptedTransport::new(research_results());
    let state = AppState::build(test_config(tmp.path()), provider.clone(), transport.clone()).unwrap();

    let outcome = run_one(&state, "s1", "find me the cheapest laptop with nvidia gpu", Mode::Chat).await;

    assert_eq!(outcome.status, TurnStatus::Ok);
    assert_eq!(provider.remaining(), 0);

    // One research call, in chat mode, with the right header mode.
    {
        let calls = transport.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "internet.research");
        assert_eq!(calls[0].2, Mode::Chat);
    }

    // §4 carries a claim with a URL, and the response link traces to it.
    let context = state.turns.read_context("s1", 1).unwrap();
    let exec_blocks = context.entries(4);
    assert!(!exec_blocks.is_empty());
    assert!(exec_blocks
        .iter()
        .any(|b| b.body.contains("https://shop.example/acer-nitro")));
    assert!(outcome.response.contains("https://shop.example/acer-nitro"));

    // §7 records the approval.
    assert!(context.latest(7).unwrap().body.contains("APPROVE"));

    // The research index picked the turn up.
    let hits = state
        .research_index
        .lookup("laptops", chrono::Utc::now())
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!((hits[0].quality_score - 0.92).abs() < 1e-9);
}

#[tokio::test]
async fn mode_violation_blocks_and_still_completes() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[
        r#"{"user_purpose": "edit a file", "data_requirements": {}, "referenced_turns": [], "topic": "code", "keywords": ["auth"]}"#,
        PASS,
        r#"{"search_terms": ["auth"], "include_preferences": false, "include_n_minus_1": false}"#,
        PASS,
        PLAN_EXECUTOR,
        r#"{"action": "COMMAND", "command": "edit auth.py to add logging"}"#,
        r#"{"tool": "file.edit", "args": {"path": "/repo/auth.py", "change": "add logging"}, "intent": null}"#,
        r#"{"action": "BLOCKED", "reason": "file edits require code mode"}"#,
        r#"{"response": "I can't edit files in chat mode — switch to code mode and I'll add the logging.", "checklist": ["blockage acknowledged"]}"#,
        APPROVE,
        SUMMARY,
    ]);
    let transport = ScriptedTransport::new(serde_json::json!({}));
    let state = AppState::build(test_config(tmp.path()), provider, transport.clone()).unwrap();

    let outcome = run_one(&state, "s1", "edit auth.py to add logging", Mode::Chat).await;

    // The turn completes ok; the blockage is surfaced, not fatal.
    assert_eq!(outcome.status, TurnStatus::Ok);
    assert!(outcome.response.contains("code mode"));
    // The write tool never reached the transport.
    assert!(transport.calls.lock().is_empty());

    let context = state.turns.read_context("s1", 1).unwrap();
    let bodies: Vec<String> = context.entries(4).iter().map(|b| b.body.clone()).collect();
    assert!(bodies.iter().any(|b| b.contains("blocked")));
    assert!(bodies.iter().any(|b| b.contains("requires code mode")));
}

#[tokio::test]
async fn validator_retry_reenters_planner_and_appends_attempts() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[
        ANALYZE_LAPTOPS,
        PASS,
        TERMS,
        PASS,
        // Attempt 1.
        PLAN_EXECUTOR,
        EXEC_RESEARCH,
        COORD_RESEARCH,
        EXEC_COMPLETE,
        r#"{"response": "Found a forum post claiming cheap laptops.", "checklist": []}"#,
        r#"{"decision": "RETRY", "confidence": 0.4, "checks": {"sources_reliable": false}, "suggested_fixes": ["avoid forums, prefer official vendor sites"]}"#,
        // Attempt 2 (re-planned with suggested fixes).
        PLAN_EXECUTOR,
        EXEC_RESEARCH,
        COORD_RESEARCH,
        EXEC_COMPLETE,
        r#"{"response": "Vendor-listed: [Acer Nitro V](https://shop.example/acer-nitro) at $849.", "checklist": ["vendor sources only"]}"#,
        APPROVE,
        SUMMARY,
    ]);
    let transport = ScriptedTransport::new(research_results());
    let state = AppState::build(test_config(tmp.path()), provider.clone(), transport.clone()).unwrap();

    let outcome = run_one(&state, "s1", "find me the cheapest laptop with nvidia gpu", Mode::Chat).await;

    assert_eq!(outcome.status, TurnStatus::Ok);
    assert_eq!(provider.remaining(), 0);
    assert_eq!(transport.calls.lock().len(), 2);

    let context = state.turns.read_context("s1", 1).unwrap();
    // §4 grew: attempt 2 blocks appended, attempt 1 preserved.
    let labels: Vec<String> = context
        .entries(4)
        .iter()
        .filter_map(|b| b.label.clone())
        .collect();
    assert!(labels.iter().any(|l| l.starts_with("Attempt 1")));
    assert!(labels.iter().any(|l| l.starts_with("Attempt 2")));
    // §7 holds both validation blocks.
    assert_eq!(context.entries(7).len(), 2);
    assert!(context.entries(7)[0].body.contains("RETRY"));
    assert!(context.entries(7)[1].body.contains("APPROVE"));
    // §3 re-planned.
    assert_eq!(context.entries(3).len(), 2);
}

#[tokio::test]
async fn first_action_complete_appends_no_iteration_blocks() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[
        ANALYZE_GREETING,
        PASS,
        TERMS,
        PASS,
        PLAN_EXECUTOR,
        EXEC_COMPLETE, // first executor action
        r#"{"response": "Nothing to do.", "checklist": []}"#,
        APPROVE,
        SUMMARY,
    ]);
    let transport = ScriptedTransport::new(serde_json::json!({}));
    let state = AppState::build(test_config(tmp.path()), provider, transport).unwrap();

    let outcome = run_one(&state, "s1", "hello", Mode::Chat).await;
    assert_eq!(outcome.status, TurnStatus::Ok);
    let context = state.turns.read_context("s1", 1).unwrap();
    assert!(context.entries(4).is_empty());
}

#[tokio::test]
async fn clarify_ends_turn_with_question() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[
        r#"{"user_purpose": "unclear", "data_requirements": {}, "referenced_turns": [], "topic": "", "keywords": []}"#,
        r#"{"decision": "clarify", "clarification": "Which laptop did you mean — the one from last week?"}"#,
        SUMMARY,
    ]);
    let transport = ScriptedTransport::new(serde_json::json!({}));
    let state = AppState::build(test_config(tmp.path()), provider.clone(), transport).unwrap();

    let outcome = run_one(&state, "s1", "what about that one?", Mode::Chat).await;
    assert_eq!(outcome.status, TurnStatus::Ok);
    assert!(outcome.response.contains("Which laptop"));
    assert_eq!(provider.remaining(), 0);
}

#[tokio::test]
async fn schema_failure_fails_fast_with_error_record() {
    let tmp = tempfile::tempdir().unwrap();
    // Analysis output is unusable prose: no strategy can recover the
    // required field.
    let provider = ScriptedProvider::new(&["I am not sure what you mean by that."]);
    let transport = ScriptedTransport::new(serde_json::json!({}));
    let state = AppState::build(test_config(tmp.path()), provider, transport).unwrap();

    let outcome = run_one(&state, "s1", "hello", Mode::Chat).await;
    assert_eq!(outcome.status, TurnStatus::Failed);
    assert_eq!(outcome.error_type, Some(ErrorKind::SchemaFailure));
    assert!(outcome.response.contains("error"));

    let records = state.interventions.error_records();
    assert!(!records.is_empty());
    assert_eq!(records[0].error_type, ErrorKind::SchemaFailure);
    // The lock is released even on failure.
    assert!(!state.session_locks.is_active("s1"));
}

#[tokio::test]
async fn cancel_mid_executor_returns_partial_progress() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[
        ANALYZE_LAPTOPS,
        PASS,
        TERMS,
        PASS,
        PLAN_EXECUTOR,
        EXEC_RESEARCH,
        COORD_RESEARCH,
        // No further stages: the cancel lands before iteration 2.
    ]);
    let entered = Arc::new(Semaphore::new(0));
    let release = Arc::new(Semaphore::new(0));
    let transport =
        ScriptedTransport::gated(research_results(), entered.clone(), release.clone());
    let state = AppState::build(test_config(tmp.path()), provider, transport.clone()).unwrap();

    let state2 = state.clone();
    let turn = tokio::spawn(async move {
        run_one(&state2, "s1", "find me the cheapest laptop with nvidia gpu", Mode::Chat).await
    });

    // Wait for the tool call to start, then inject the cancel.
    let permit = entered.acquire().await.unwrap();
    permit.forget();
    match handle_message(&state, "s1", "cancel", Mode::Chat).await {
        HandleResult::Injected(InterventionKind::Cancel) => {}
        other => panic!("expected cancel injection, got {:?}", discriminant_name(&other)),
    }
    // Let the in-flight tool finish; cancellation is honored at the next
    // checkpoint, preserving the §4 block.
    release.add_permits(1);

    let outcome = turn.await.unwrap();
    assert_eq!(outcome.status, TurnStatus::CancelledPartial);
    assert!(outcome.partial_results.is_some());
    assert!(outcome.response.contains("internet.research"));

    // The lock is free again: a fresh message starts a new turn (and
    // fails fast on the exhausted script, which is fine here).
    assert!(!state.session_locks.is_active("s1"));
}

fn discriminant_name(result: &HandleResult) -> &'static str {
    match result {
        HandleResult::Injected(_) => "Injected",
        HandleResult::Completed(_) => "Completed",
    }
}

#[tokio::test]
async fn reflector_batches_stage_then_promote() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(&[]);
    let transport = ScriptedTransport::new(serde_json::json!({}));
    let state = AppState::build(test_config(tmp.path()), provider.clone(), transport).unwrap();

    // Seed one simple turn so batches have something to cite.
    for response in [
        ANALYZE_GREETING,
        PASS,
        r#"{"search_terms": ["hamster"], "include_preferences": false, "include_n_minus_1": false}"#,
        PASS,
        PLAN_SYNTHESIS,
        r#"{"response": "Syrian hamsters are a great pick.", "checklist": []}"#,
        APPROVE,
        r#"{"summary": "Talked about syrian hamsters.", "topic": "hamsters", "keywords": ["hamster"], "content_type": "general_fact"}"#,
    ] {
        provider.push(response);
    }
    let outcome = run_one(&state, "s1", "tell me about my syrian hamster", Mode::Chat).await;
    assert_eq!(outcome.status, TurnStatus::Ok);

    const REFLECTION: &str = r#"{"new_facts": [{"content": "User keeps a syrian hamster", "source_turns": ["turn_000001"], "content_type": "preference"}], "corrections": [], "connections": [], "open_questions": []}"#;

    // Batch 1 stages the fact; it is invisible to the live corpus.
    provider.push(REFLECTION);
    state.reflector.run_batch("s1").await;
    let staged = state.knowledge.list_staged("s1").unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].promotion_count, 0);
    assert!(state.knowledge.list_knowledge("s1").unwrap().is_empty());

    // Batch 2 re-observes: promotion_count goes to 1, still staged.
    provider.push(REFLECTION);
    state.reflector.run_batch("s1").await;
    let staged = state.knowledge.list_staged("s1").unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].promotion_count, 1);

    // Batch 3 re-observes again: count reaches 2 and the item goes live.
    provider.push(REFLECTION);
    state.reflector.run_batch("s1").await;
    assert!(state.knowledge.list_staged("s1").unwrap().is_empty());
    let live = state.knowledge.list_knowledge("s1").unwrap();
    assert_eq!(live.len(), 1);
    assert!(live[0].1.contains("syrian hamster"));
}

/// Answers by stage (recognized from the system prompt) rather than by
/// script position, so concurrent sessions can interleave freely.
struct StageAwareProvider;

#[async_trait]
impl LlmProvider for StageAwareProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let system = &req.messages[0].content;
        let content = if system.contains("Analyze the user query") {
            ANALYZE_GREETING
        } else if system.contains("Validate the preceding stage") {
            PASS
        } else if system.contains("search terms") {
            r#"{"search_terms": ["hello"], "include_preferences": false, "include_n_minus_1": false}"#
        } else if system.contains("strategic plan") {
            PLAN_SYNTHESIS
        } else if system.contains("user-facing response") {
            r#"{"response": "Hi!", "checklist": []}"#
        } else if system.contains("Validate the response") {
            APPROVE
        } else if system.contains("Summarize this turn") {
            SUMMARY
        } else if system.contains("Organize the retrieved context") {
            r#"{"summary": "prior greetings", "gaps": []}"#
        } else {
            return Err(Error::Llm(format!("unrecognized stage prompt: {system}")));
        };
        Ok(ChatResponse {
            content: content.to_string(),
            usage: Some(Usage::default()),
            model: "stage-aware".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        Err(Error::Llm("embeddings unavailable".into()))
    }

    fn provider_id(&self) -> &str {
        "stage-aware"
    }
}

#[tokio::test]
async fn sessions_run_concurrently_and_serialize_within_themselves() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new(serde_json::json!({}));
    let state = AppState::build(
        test_config(tmp.path()),
        Arc::new(StageAwareProvider),
        transport,
    )
    .unwrap();

    let (a, b) = tokio::join!(
        run_one(&state, "s1", "hello", Mode::Chat),
        run_one(&state, "s2", "hello", Mode::Chat),
    );
    assert_eq!(a.status, TurnStatus::Ok);
    assert_eq!(b.status, TurnStatus::Ok);
    assert!(state.turns.read_context("s1", 1).is_ok());
    assert!(state.turns.read_context("s2", 1).is_ok());

    // A second turn in an existing session gets the next turn number.
    let again = run_one(&state, "s1", "hello", Mode::Chat).await;
    assert_eq!(again.status, TurnStatus::Ok);
    assert!(state.turns.read_context("s1", 2).is_ok());
}
