//! Batch reflector — background distillation of recent turns into staged,
//! promotable knowledge.
//!
//! The signal accumulator is code-only and written solely by the main
//! pipeline at save time; a batch reads a snapshot and resets it in one
//! atomic update. The batch itself runs as a detached task wrapped in a
//! catch-all: it never affects the main pipeline. Proposed items pass the
//! quality gates, land in staging (invisible to retrieval), and are
//! promoted only after re-observation in later batches.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cox_domain::config::Config;
use cox_domain::error::Result;
use cox_domain::node::{ContentType, MemoryNode, SourceType};
use cox_domain::recipe::StageName;
use cox_memory::bm25;
use cox_store::layout::{parse_turn_id, turn_id, Layout};
use cox_store::{KnowledgeStore, StagedKnowledge, TurnStore};

use super::schemas::reflection_schema;
use super::stages::{PromptSection, StageRunner};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Code-detected per-turn signals fed by the save pipeline.
#[derive(Debug, Clone)]
pub struct TurnSignals {
    pub topic: String,
    pub corrected: bool,
    /// Quality score when an approved research turn ran.
    pub research_quality: Option<f64>,
    pub routed_refresh: bool,
    pub contradiction: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SignalState {
    turns_since_batch: u32,
    urgency: f64,
    recent_topics: Vec<String>,
    last_batch_turn: u64,
}

const TOPIC_WINDOW: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reflector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Reflector {
    config: Arc<Config>,
    layout: Layout,
    turns: Arc<TurnStore>,
    knowledge: Arc<KnowledgeStore>,
    stages: Arc<StageRunner>,
}

impl Reflector {
    pub fn new(
        config: Arc<Config>,
        layout: Layout,
        turns: Arc<TurnStore>,
        knowledge: Arc<KnowledgeStore>,
        stages: Arc<StageRunner>,
    ) -> Self {
        Self {
            config,
            layout,
            turns,
            knowledge,
            stages,
        }
    }

    fn signals_file(&self, user_id: &str) -> std::path::PathBuf {
        self.layout.reflector_log_dir(user_id).join("signals.json")
    }

    fn load_signals(&self, user_id: &str) -> SignalState {
        let path = self.signals_file(user_id);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write_signals(&self, user_id: &str, state: &SignalState) -> Result<()> {
        let path = self.signals_file(user_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Atomic update: write sidecar, then rename over.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Accumulate one saved turn's signals. Returns whether a batch
    /// should trigger.
    pub fn record_turn_signals(&self, user_id: &str, signals: &TurnSignals) -> Result<bool> {
        let weights = self.config.reflector.weights;
        let mut state = self.load_signals(user_id);

        state.turns_since_batch += 1;
        if !signals.topic.is_empty() {
            if state.recent_topics.iter().any(|t| t == &signals.topic) {
                state.urgency += weights.topic_repetition;
            }
            state.recent_topics.push(signals.topic.clone());
            let len = state.recent_topics.len();
            if len > TOPIC_WINDOW {
                state.recent_topics.drain(..len - TOPIC_WINDOW);
            }
        }
        if signals.corrected {
            state.urgency += weights.user_correction;
        }
        if signals.research_quality.map(|q| q >= 0.85).unwrap_or(false) {
            state.urgency += weights.quality_research;
        }
        if signals.routed_refresh {
            state.urgency += weights.refresh_context;
        }
        if signals.contradiction {
            state.urgency += weights.contradiction;
        }

        let trigger = state.turns_since_batch >= self.config.reflector.turns_per_batch
            || state.urgency > self.config.reflector.urgency_threshold;
        self.write_signals(user_id, &state)?;
        if trigger {
            tracing::info!(
                user = user_id,
                turns = state.turns_since_batch,
                urgency = state.urgency,
                "reflector batch triggered"
            );
        }
        Ok(trigger)
    }

    // ── Batch run ─────────────────────────────────────────────────

    /// Run one batch. Isolation wrapper: errors are logged, never
    /// propagated to the pipeline.
    pub async fn run_batch(&self, user_id: &str) {
        // Yield before the heavy work so the triggering turn's response
        // is not delayed.
        tokio::task::yield_now().await;
        match self.run_batch_inner(user_id).await {
            Ok(log) => {
                tracing::info!(
                    user = user_id,
                    batch = %log.batch_id,
                    staged = log.staged.len(),
                    promoted = log.promoted.len(),
                    "reflector batch complete"
                );
            }
            Err(e) => {
                tracing::warn!(user = user_id, error = %e, "reflector batch failed (isolated)");
            }
        }
    }

    async fn run_batch_inner(&self, user_id: &str) -> Result<BatchLog> {
        let batch_id = format!("batch_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let mut log = BatchLog {
            batch_id: batch_id.clone(),
            user_id: user_id.to_string(),
            started_at: Utc::now(),
            read_turns: Vec::new(),
            proposed: 0,
            rejected: Vec::new(),
            staged: Vec::new(),
            promoted: Vec::new(),
            expired: 0,
        };

        // Snapshot-and-reset the accumulator in one atomic update.
        let snapshot = self.load_signals(user_id);
        let recent = self
            .turns
            .recent_turns(user_id, self.config.reflector.batch_window)?;
        self.write_signals(
            user_id,
            &SignalState {
                last_batch_turn: recent.first().copied().unwrap_or(snapshot.last_batch_turn),
                ..SignalState::default()
            },
        )?;

        // Read the batch window's turns (query + response).
        let mut turn_bodies: HashMap<String, String> = HashMap::new();
        for number in &recent {
            let id = turn_id(*number);
            let context = self.turns.read_context(user_id, *number)?;
            let query = context.latest(0).map(|s| s.body.clone()).unwrap_or_default();
            let response = self.turns.read_response(user_id, *number).unwrap_or_default();
            turn_bodies.insert(id.clone(), format!("{query}\n{response}"));
            log.read_turns.push(id);
        }
        if turn_bodies.is_empty() {
            self.write_batch_log(user_id, &log)?;
            return Ok(log);
        }

        // Related existing knowledge, found by BM25 over the live corpus.
        let knowledge_items = self.knowledge.list_knowledge(user_id)?;
        let mut knowledge_index = bm25::Bm25Index::new();
        for (node, text) in &knowledge_items {
            knowledge_index.add_doc(&node.id, text);
        }
        let batch_text: String = turn_bodies.values().cloned().collect::<Vec<_>>().join("\n");
        let related: Vec<String> = knowledge_index
            .search(&top_keywords(&batch_text, 8).join(" "))
            .into_iter()
            .take(5)
            .filter_map(|(id, _)| {
                knowledge_items
                    .iter()
                    .find(|(n, _)| n.id == id)
                    .map(|(n, text)| format!("- [{}] {}", n.id, text))
            })
            .collect();

        // One MIND call, schema-bound.
        let mut turns_section = String::new();
        for (id, body) in &turn_bodies {
            turns_section.push_str(&format!("### {id}\n{body}\n\n"));
        }
        let sections = vec![
            PromptSection::new("Recent Turns", &turns_section, 1, 0.9, 2),
            PromptSection::new("Existing Knowledge", &related.join("\n"), 2, 0.8, 1),
        ];
        let out = self
            .stages
            .run_stage(
                StageName::Reflect,
                &sections,
                "Distill durable knowledge from these turns.",
                &reflection_schema(),
            )
            .await?;

        // Hard-cap the lists after return.
        let cfg = &self.config.reflector;
        let new_facts = capped_items(&out.value["new_facts"], cfg.max_new_facts);
        let corrections = capped_items(&out.value["corrections"], cfg.max_corrections);
        let connections = capped_items(&out.value["connections"], cfg.max_connections);
        log.proposed = new_facts.len() + corrections.len() + connections.len();

        let knowledge_texts: Vec<&str> =
            knowledge_items.iter().map(|(_, text)| text.as_str()).collect();

        // Gate and stage. An item already sitting in staging is not
        // duplicated; the promotion pass below counts it instead.
        let staged_before = self.knowledge.list_staged(user_id)?;
        let mut batch_outputs: Vec<String> = Vec::new();
        for (kind, items) in [
            ("fact", &new_facts),
            ("correction", &corrections),
            ("connection", &connections),
        ] {
            for item in items {
                batch_outputs.push(item.content.clone());
                let already_staged = staged_before.iter().any(|s| {
                    bm25::similarity(&s.content, &item.content) >= cfg.promotion_similarity
                });
                if already_staged {
                    continue;
                }
                match self.gate_item(user_id, kind, item, &turn_bodies, &knowledge_texts) {
                    Ok(confidence) => {
                        let staged = self.stage_item(user_id, &batch_id, item, confidence)?;
                        log.staged.push(staged.node.id.clone());
                    }
                    Err(reason) => {
                        log.rejected.push(format!("{kind}: {reason}"));
                    }
                }
            }
        }

        // Promotion pass: staged items re-observed by this batch's output.
        let staged_items = self.knowledge.list_staged(user_id)?;
        for mut item in staged_items {
            if log.staged.contains(&item.node.id) {
                continue; // freshly staged this batch
            }
            let re_observed = batch_outputs
                .iter()
                .any(|text| bm25::similarity(text, &item.content) >= cfg.promotion_similarity);
            if !re_observed {
                continue;
            }
            item.promotion_count += 1;
            if item.promotion_count >= cfg.promotion_count {
                self.knowledge.promote(user_id, &item)?;
                log.promoted.push(item.node.id.clone());
            } else {
                self.knowledge.update_staged(user_id, &item)?;
            }
        }

        // Expiry sweep.
        log.expired = self.knowledge.expire_staged(
            user_id,
            Utc::now(),
            cfg.staging_expiry_days,
            cfg.promotion_count,
        )?;

        self.write_batch_log(user_id, &log)?;
        Ok(log)
    }

    // ── Quality gates ─────────────────────────────────────────────

    fn gate_item(
        &self,
        user_id: &str,
        kind: &str,
        item: &ProposedItem,
        turn_bodies: &HashMap<String, String>,
        knowledge_texts: &[&str],
    ) -> std::result::Result<f64, String> {
        if item.content.trim().is_empty() {
            return Err("empty content".into());
        }
        if item.source_turns.is_empty() {
            return Err("no cited turns".into());
        }

        // Every cited turn must exist.
        for cited in &item.source_turns {
            let exists = turn_bodies.contains_key(cited)
                || parse_turn_id(cited)
                    .map(|n| self.layout.turn_dir(user_id, n).exists())
                    .unwrap_or(false);
            if !exists {
                return Err(format!("cited turn {cited} does not exist"));
            }
        }

        // At least one keyword of the item must appear in a cited turn.
        let keywords: Vec<String> = bm25::tokenize(&item.content)
            .into_iter()
            .filter(|t| t.len() >= 3)
            .collect();
        let keyword_hit = item.source_turns.iter().any(|cited| {
            let body = turn_bodies
                .get(cited)
                .cloned()
                .or_else(|| {
                    parse_turn_id(cited).and_then(|n| {
                        self.turns
                            .read_context(user_id, n)
                            .ok()
                            .and_then(|c| c.latest(0).map(|s| s.body.clone()))
                    })
                })
                .unwrap_or_default()
                .to_lowercase();
            keywords.iter().any(|k| body.contains(k))
        });
        if !keyword_hit {
            return Err("no keyword overlap with cited turns".into());
        }

        // Already known? Suppress near-duplicates of live knowledge.
        let max_similarity = knowledge_texts
            .iter()
            .map(|text| bm25::similarity(&item.content, text))
            .fold(0.0f64, f64::max);
        if max_similarity >= self.config.reflector.known_similarity_ceiling {
            return Err(format!("already known (similarity {max_similarity:.2})"));
        }

        // Corrections: the target must exist, and the drift guard rejects
        // single-turn corrections of high-confidence targets.
        if kind == "correction" {
            let Some(target) = &item.target else {
                return Err("correction without a target".into());
            };
            let live = self.knowledge.list_knowledge(user_id).unwrap_or_default();
            let Some((target_node, _)) = live.iter().find(|(n, _)| &n.id == target) else {
                return Err(format!("correction target {target} does not exist"));
            };
            if target_node.initial_confidence > 0.9 && item.source_turns.len() <= 1 {
                return Err("drift guard: high-confidence target, single-turn evidence".into());
            }
        }

        // Confidence from source-turn count.
        let count = item.source_turns.len();
        let confidence = match count {
            1 => 0.60,
            2 => 0.75,
            _ => {
                let any_quality = item.source_turns.iter().any(|cited| {
                    parse_turn_id(cited)
                        .and_then(|n| self.turns.read_metadata(user_id, n).ok())
                        .map(|m| m.quality_score >= 0.80)
                        .unwrap_or(false)
                });
                if any_quality {
                    0.85
                } else {
                    0.75
                }
            }
        };
        Ok(confidence)
    }

    fn stage_item(
        &self,
        user_id: &str,
        batch_id: &str,
        item: &ProposedItem,
        confidence: f64,
    ) -> Result<StagedKnowledge> {
        let id = format!("k_{}", uuid::Uuid::new_v4().simple());
        let staged = StagedKnowledge {
            node: MemoryNode {
                id: id.clone(),
                path: format!("Knowledge_staging/{id}.json"),
                source_type: SourceType::Fact,
                content_type: item.content_type.unwrap_or(ContentType::GeneralFact),
                initial_confidence: confidence,
                created_at: Utc::now(),
                validation_count: None,
                validation_success: None,
                source_id: Some(batch_id.to_string()),
            },
            content: item.content.clone(),
            staged_at: Utc::now(),
            batch_id: batch_id.to_string(),
            promotion_count: 0,
            source_turns: item.source_turns.clone(),
        };
        self.knowledge.stage(user_id, &staged)?;
        Ok(staged)
    }

    fn write_batch_log(&self, user_id: &str, log: &BatchLog) -> Result<()> {
        let dir = self.layout.reflector_log_dir(user_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", log.batch_id));
        std::fs::write(path, serde_json::to_vec_pretty(log)?)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Proposed items & batch log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
struct ProposedItem {
    content: String,
    source_turns: Vec<String>,
    content_type: Option<ContentType>,
    /// Knowledge node a correction targets.
    target: Option<String>,
}

fn capped_items(value: &Value, cap: usize) -> Vec<ProposedItem> {
    let Some(rows) = value.as_array() else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let content = row.get("content").and_then(Value::as_str)?.to_string();
            let source_turns = row
                .get("source_turns")
                .and_then(Value::as_array)
                .map(|xs| {
                    xs.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            let content_type = row
                .get("content_type")
                .and_then(Value::as_str)
                .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok());
            Some(ProposedItem {
                content,
                source_turns,
                content_type,
                target: row.get("target").and_then(Value::as_str).map(String::from),
            })
        })
        .take(cap)
        .collect()
}

/// Per-batch JSON log written under `Logs/reflector/`.
#[derive(Debug, Clone, Serialize)]
struct BatchLog {
    batch_id: String,
    user_id: String,
    started_at: chrono::DateTime<Utc>,
    read_turns: Vec<String>,
    proposed: usize,
    rejected: Vec<String>,
    staged: Vec<String>,
    promoted: Vec<String>,
    expired: usize,
}

/// Most frequent tokens (length ≥ 4) in a text blob.
fn top_keywords(text: &str, n: usize) -> Vec<String> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for token in bm25::tokenize(text) {
        if token.len() >= 4 {
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, u32)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(t, _)| t).collect()
}
