//! Shared application state passed to all API handlers and the runtime.

use std::sync::Arc;
use std::time::Duration;

use cox_domain::config::Config;
use cox_domain::error::Result;
use cox_providers::{LlmProvider, RoleRouter};
use cox_store::{CalibrationLog, KnowledgeStore, Layout, ResearchIndex, TurnIndex, TurnStore};
use cox_tools::{ApprovalStore, PermissionGate, ToolExecutor, ToolTransport};
use cox_workflows::WorkflowRegistry;

use crate::runtime::interventions::InterventionQueue;
use crate::runtime::reflector::Reflector;
use crate::runtime::session_lock::ActiveTurnLocks;
use crate::runtime::stages::StageRunner;

/// Everything a request handler or a running turn needs.
///
/// Fields are grouped by concern:
/// - **Core** — config, stage runner (LLM), tool executor
/// - **Persistence** — turn store, knowledge, indexes, calibration
/// - **Coordination** — session locks, interventions, approvals
/// - **Background** — the batch reflector
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub stages: Arc<StageRunner>,
    pub executor: Arc<ToolExecutor>,
    pub workflows: Arc<WorkflowRegistry>,

    // ── Persistence ───────────────────────────────────────────────
    pub turns: Arc<TurnStore>,
    pub knowledge: Arc<KnowledgeStore>,
    pub turn_index: Arc<TurnIndex>,
    pub research_index: Arc<ResearchIndex>,
    pub calibration: Arc<CalibrationLog>,

    // ── Coordination ──────────────────────────────────────────────
    pub session_locks: Arc<ActiveTurnLocks>,
    pub interventions: Arc<InterventionQueue>,
    pub approvals: Arc<ApprovalStore>,

    // ── Background ────────────────────────────────────────────────
    pub reflector: Arc<Reflector>,
}

impl AppState {
    /// Assemble the state around explicit provider/transport
    /// implementations. `bootstrap` passes the real HTTP adapters; tests
    /// pass scripted fakes.
    pub fn build(
        config: Config,
        provider: Arc<dyn LlmProvider>,
        transport: Arc<dyn ToolTransport>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let layout = Layout::new(&config.storage.root);

        let router = Arc::new(RoleRouter::new(provider, config.llm.clone()));
        let stages = Arc::new(StageRunner::new(router.clone(), config.recipes.clone()));

        let approvals = Arc::new(ApprovalStore::new(Duration::from_secs(
            config.tools.approval_timeout_secs,
        )));
        let gate = Arc::new(PermissionGate::new(config.tools.clone(), approvals.clone()));
        let workflows = Arc::new(WorkflowRegistry::load(
            &config.workflows.dir,
            config.workflows.match_threshold,
            Some(router.clone()),
        )?);
        let executor = Arc::new(ToolExecutor::new(transport, gate, workflows.clone()));

        let turns = Arc::new(TurnStore::new(layout.clone()));
        let knowledge = Arc::new(KnowledgeStore::new(layout.clone()));
        let turn_index = Arc::new(TurnIndex::new(layout.turn_index_file()));
        let research_index = Arc::new(ResearchIndex::new(layout.research_index_file()));
        let calibration = Arc::new(CalibrationLog::new(layout.calibration_file()));

        let interventions = Arc::new(InterventionQueue::new(
            config.interventions,
            Some(layout.intervention_snapshot_file()),
            Some(layout.emergency_log_file()),
        ));

        let reflector = Arc::new(Reflector::new(
            config.clone(),
            layout,
            turns.clone(),
            knowledge.clone(),
            stages.clone(),
        ));

        Ok(Self {
            config,
            stages,
            executor,
            workflows,
            turns,
            knowledge,
            turn_index,
            research_index,
            calibration,
            session_locks: Arc::new(ActiveTurnLocks::new()),
            interventions,
            approvals,
            reflector,
        })
    }
}
