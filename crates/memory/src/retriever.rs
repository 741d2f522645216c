//! Search-first context retrieval.
//!
//! One REFLEX call plans the search (terms + always-include flags); each
//! term then runs BM25 and embedding search in tandem; results fuse via
//! reciprocal ranks; the confidence floor drops expired nodes. Degradations
//! are explicit and logged: term-generation failure falls back to keyword
//! extraction, embedding failure falls back to BM25-only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use cox_domain::config::MemoryConfig;
use cox_domain::error::Result;
use cox_domain::node::{ContentType, MemoryNode, SourceType};
use cox_domain::recipe::Role;
use cox_providers::parse::{parse_stage_output, FieldKind, FieldSpec, SchemaSpec};
use cox_providers::{ChatMessage, RoleRouter};
use cox_store::{KnowledgeStore, TurnStore};

use crate::bm25::{tokenize, Bm25Index};
use crate::confidence::current_confidence;
use crate::embed::EmbeddingIndex;
use crate::rrf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Search,
    AlwaysInclude,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_path: String,
    pub source_type: SourceType,
    pub node_id: String,
    pub rrf_score: f64,
    /// Best BM25 rank across terms (1-based), when BM25 matched.
    pub bm25_rank: Option<usize>,
    /// Best embedding rank across terms (1-based), when embeddings matched.
    pub embedding_rank: Option<usize>,
    pub snippet: String,
    pub source: HitSource,
    /// Decayed confidence at retrieval time.
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalStats {
    pub terms: Vec<String>,
    pub degraded_term_generation: bool,
    pub degraded_embeddings: bool,
    pub candidates: usize,
    pub dropped_below_floor: usize,
    /// Tokens spent by the term-generation call, for the turn's metrics.
    pub term_gen_tokens_in: u32,
    pub term_gen_tokens_out: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub stats: RetrievalStats,
}

/// Always-include directives resolved by query analysis.
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    /// The immediately previous turn's number, when one exists.
    pub previous_turn: Option<u64>,
    /// Turn numbers explicitly referenced by the query.
    pub referenced_turns: Vec<u64>,
}

/// One searchable document: node metadata plus its text.
#[derive(Debug, Clone)]
pub struct CorpusDoc {
    pub node: MemoryNode,
    pub text: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retriever
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_SEARCH_TERMS: usize = 5;
const SNIPPET_LEN: usize = 160;
/// How many prior turns the corpus covers.
const CORPUS_TURN_WINDOW: usize = 200;

pub struct MemoryRetriever {
    user_id: String,
    /// Keyed by document path.
    docs: HashMap<String, CorpusDoc>,
    bm25: Bm25Index,
    embeddings: EmbeddingIndex,
    degraded_embeddings: bool,
    cfg: MemoryConfig,
    router: Arc<RoleRouter>,
}

impl MemoryRetriever {
    /// Build the per-user corpus from the document store: prior-turn
    /// summaries, promoted knowledge, and the preferences file. Staged
    /// knowledge is deliberately absent.
    pub fn build(
        user_id: &str,
        turns: &TurnStore,
        knowledge: &KnowledgeStore,
        router: Arc<RoleRouter>,
        cfg: MemoryConfig,
    ) -> Result<Self> {
        let mut docs = Vec::new();

        for turn_number in turns.recent_turns(user_id, CORPUS_TURN_WINDOW)? {
            let parsed = match turns.read_context(user_id, turn_number) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(turn = turn_number, error = %e, "skipping unreadable turn");
                    continue;
                }
            };
            let Some(summary) = parsed.appendix else {
                continue;
            };
            let turn_id = cox_store::layout::turn_id(turn_number);
            let created_at = turns
                .read_metadata(user_id, turn_number)
                .map(|m| m.timestamp)
                .unwrap_or_else(|_| Utc::now());
            docs.push(CorpusDoc {
                node: MemoryNode {
                    id: turn_id.clone(),
                    path: format!("turns/{turn_id}/context.md"),
                    source_type: SourceType::TurnSummary,
                    content_type: ContentType::GeneralFact,
                    initial_confidence: 0.70,
                    created_at,
                    validation_count: None,
                    validation_success: None,
                    source_id: None,
                },
                text: summary,
            });
        }

        for (node, text) in knowledge.list_knowledge(user_id)? {
            docs.push(CorpusDoc { node, text });
        }

        let pref_path = turns.layout().preferences_file(user_id);
        if pref_path.exists() {
            let text = std::fs::read_to_string(&pref_path)?;
            docs.push(CorpusDoc {
                node: preferences_node(),
                text,
            });
        }

        Ok(Self::from_docs(user_id, docs, router, cfg))
    }

    /// Construct directly from documents (no disk). Embeddings start
    /// un-indexed; call [`index_embeddings`](Self::index_embeddings).
    pub fn from_docs(
        user_id: &str,
        docs: Vec<CorpusDoc>,
        router: Arc<RoleRouter>,
        cfg: MemoryConfig,
    ) -> Self {
        let mut bm25 = Bm25Index::new();
        let mut map = HashMap::new();
        for doc in docs {
            bm25.add_doc(&doc.node.path, &doc.text);
            map.insert(doc.node.path.clone(), doc);
        }
        Self {
            user_id: user_id.to_string(),
            docs: map,
            bm25,
            embeddings: EmbeddingIndex::new(),
            degraded_embeddings: false,
            cfg,
            router,
        }
    }

    /// Batch-embed the corpus. Embedding-service failure degrades to
    /// BM25-only retrieval — logged, never silent.
    pub async fn index_embeddings(&mut self) {
        if self.docs.is_empty() {
            return;
        }
        let (paths, texts): (Vec<String>, Vec<String>) = self
            .docs
            .values()
            .map(|d| (d.node.path.clone(), d.text.clone()))
            .unzip();
        match self.router.embed(texts).await {
            Ok(vectors) => {
                for (path, vector) in paths.into_iter().zip(vectors) {
                    self.embeddings.insert(&path, vector);
                }
            }
            Err(e) => {
                tracing::warn!(
                    user = %self.user_id,
                    error = %e,
                    "embedding service unavailable; retrieval degrades to BM25-only"
                );
                self.degraded_embeddings = true;
            }
        }
    }

    pub fn corpus_len(&self) -> usize {
        self.docs.len()
    }

    // ── Retrieval ─────────────────────────────────────────────────

    /// Retrieve context for a query. An empty query returns empty results
    /// without error; downstream context synthesis handles the zero-node
    /// scaffold.
    pub async fn retrieve(
        &self,
        query: &str,
        purpose: &str,
        opts: &RetrieveOptions,
    ) -> Result<SearchResults> {
        if query.trim().is_empty() {
            return Ok(SearchResults::default());
        }

        let plan = self.generate_terms(query, purpose).await;
        let mut stats = RetrievalStats {
            terms: plan.terms.clone(),
            degraded_term_generation: plan.degraded,
            degraded_embeddings: self.degraded_embeddings,
            term_gen_tokens_in: plan.tokens_in,
            term_gen_tokens_out: plan.tokens_out,
            ..RetrievalStats::default()
        };

        // Per-term, per-method rankings.
        let mut rankings: Vec<Vec<String>> = Vec::new();
        let mut best_bm25: HashMap<String, usize> = HashMap::new();
        let mut best_emb: HashMap<String, usize> = HashMap::new();
        let mut embeddings_down = self.degraded_embeddings || self.embeddings.is_empty();

        for term in &plan.terms {
            let bm_hits = self.bm25.search(term);
            for (idx, (path, _)) in bm_hits.iter().enumerate() {
                let rank = idx + 1;
                best_bm25
                    .entry(path.clone())
                    .and_modify(|r| *r = (*r).min(rank))
                    .or_insert(rank);
            }
            rankings.push(bm_hits.into_iter().map(|(path, _)| path).collect());

            if !embeddings_down {
                match self.router.embed(vec![term.clone()]).await {
                    Ok(mut vectors) => {
                        let vector = vectors.pop().unwrap_or_default();
                        let emb_hits = self.embeddings.search(&vector, self.cfg.min_cosine);
                        for (idx, (path, _)) in emb_hits.iter().enumerate() {
                            let rank = idx + 1;
                            best_emb
                                .entry(path.clone())
                                .and_modify(|r| *r = (*r).min(rank))
                                .or_insert(rank);
                        }
                        rankings.push(emb_hits.into_iter().map(|(path, _)| path).collect());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "query embedding failed; BM25-only for this retrieval");
                        embeddings_down = true;
                        stats.degraded_embeddings = true;
                    }
                }
            }
        }

        let fused = rrf::fuse(&rankings, self.cfg.rrf_k);
        stats.candidates = fused.len();

        let now = Utc::now();
        let mut hits: Vec<SearchHit> = Vec::new();
        for (path, rrf_score) in fused {
            let Some(doc) = self.docs.get(&path) else {
                continue;
            };
            let confidence = current_confidence(&doc.node, &self.cfg.decay, now);
            if confidence < self.cfg.confidence_floor {
                stats.dropped_below_floor += 1;
                continue;
            }
            hits.push(SearchHit {
                document_path: path.clone(),
                source_type: doc.node.source_type,
                node_id: doc.node.id.clone(),
                rrf_score,
                bm25_rank: best_bm25.get(&path).copied(),
                embedding_rank: best_emb.get(&path).copied(),
                snippet: snippet(&doc.text),
                source: HitSource::Search,
                confidence,
            });
        }
        hits.truncate(self.cfg.top_k);

        // Always-include rules append after the ranked hits; the
        // confidence floor still applies.
        let mut always_paths: Vec<String> = Vec::new();
        if plan.include_preferences {
            always_paths.push("preferences.md".into());
        }
        if plan.include_n_minus_1 {
            if let Some(prev) = opts.previous_turn {
                let id = cox_store::layout::turn_id(prev);
                always_paths.push(format!("turns/{id}/context.md"));
            }
        }
        for turn in &opts.referenced_turns {
            let id = cox_store::layout::turn_id(*turn);
            always_paths.push(format!("turns/{id}/context.md"));
        }

        for path in always_paths {
            if hits.iter().any(|h| h.document_path == path) {
                continue;
            }
            let Some(doc) = self.docs.get(&path) else {
                continue;
            };
            let confidence = current_confidence(&doc.node, &self.cfg.decay, now);
            if confidence < self.cfg.confidence_floor {
                stats.dropped_below_floor += 1;
                continue;
            }
            hits.push(SearchHit {
                document_path: path.clone(),
                source_type: doc.node.source_type,
                node_id: doc.node.id.clone(),
                rrf_score: 0.0,
                bm25_rank: None,
                embedding_rank: None,
                snippet: snippet(&doc.text),
                source: HitSource::AlwaysInclude,
                confidence,
            });
        }

        tracing::debug!(
            user = %self.user_id,
            terms = stats.terms.len(),
            hits = hits.len(),
            dropped = stats.dropped_below_floor,
            "retrieval complete"
        );
        Ok(SearchResults { hits, stats })
    }

    // ── Term generation ───────────────────────────────────────────

    async fn generate_terms(&self, query: &str, purpose: &str) -> TermPlan {
        let schema = SchemaSpec {
            name: "search_terms",
            fields: vec![
                FieldSpec::required("search_terms", FieldKind::StringList),
                FieldSpec::optional("include_preferences", FieldKind::Bool, serde_json::json!(true)),
                FieldSpec::optional("include_n_minus_1", FieldKind::Bool, serde_json::json!(true)),
            ],
        };

        let messages = vec![
            ChatMessage::system(
                "Produce 3-5 short memory search terms for the query, as JSON: \
                 {\"search_terms\": [...], \"include_preferences\": bool, \"include_n_minus_1\": bool}",
            ),
            ChatMessage::user(format!("Query: {query}\nPurpose: {purpose}")),
        ];

        let response = self
            .router
            .chat_as(Role::Reflex, messages, Some(300), None)
            .await;

        match response {
            Ok(resp) => match parse_stage_output(&resp.content, &schema) {
                Ok(parsed) => {
                    let mut terms: Vec<String> = parsed.value["search_terms"]
                        .as_array()
                        .map(|xs| {
                            xs.iter()
                                .filter_map(|v| v.as_str())
                                .map(String::from)
                                .filter(|t| !t.trim().is_empty())
                                .collect()
                        })
                        .unwrap_or_default();
                    terms.truncate(MAX_SEARCH_TERMS);
                    if terms.is_empty() {
                        return self.fallback_terms(query, "empty term list");
                    }
                    let usage = resp.usage.unwrap_or_default();
                    TermPlan {
                        terms,
                        include_preferences: parsed.value["include_preferences"]
                            .as_bool()
                            .unwrap_or(true),
                        include_n_minus_1: parsed.value["include_n_minus_1"]
                            .as_bool()
                            .unwrap_or(true),
                        degraded: false,
                        tokens_in: usage.prompt_tokens,
                        tokens_out: usage.completion_tokens,
                    }
                }
                Err(e) => self.fallback_terms(query, &e.to_string()),
            },
            Err(e) => self.fallback_terms(query, &e.to_string()),
        }
    }

    /// Keyword-extraction fallback — an explicit, logged degradation.
    fn fallback_terms(&self, query: &str, reason: &str) -> TermPlan {
        tracing::warn!(
            user = %self.user_id,
            reason,
            "search-term generation degraded to keyword extraction"
        );
        let mut seen = std::collections::HashSet::new();
        let terms: Vec<String> = tokenize(query)
            .into_iter()
            .filter(|t| t.len() >= 3 && !is_stopword(t))
            .filter(|t| seen.insert(t.clone()))
            .take(MAX_SEARCH_TERMS)
            .collect();
        TermPlan {
            terms,
            include_preferences: true,
            include_n_minus_1: true,
            degraded: true,
            tokens_in: 0,
            tokens_out: 0,
        }
    }
}

struct TermPlan {
    terms: Vec<String>,
    include_preferences: bool,
    include_n_minus_1: bool,
    degraded: bool,
    tokens_in: u32,
    tokens_out: u32,
}

fn preferences_node() -> MemoryNode {
    MemoryNode {
        id: "preferences".into(),
        path: "preferences.md".into(),
        source_type: SourceType::Preference,
        content_type: ContentType::Preference,
        initial_confidence: 0.95,
        created_at: Utc::now(),
        validation_count: None,
        validation_success: None,
        source_id: None,
    }
}

fn snippet(text: &str) -> String {
    if text.len() <= SNIPPET_LEN {
        return text.to_string();
    }
    let mut end = SNIPPET_LEN;
    while !text.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "the" | "and" | "for" | "with" | "that" | "this" | "what" | "whats" | "was" | "are"
            | "can" | "you" | "your" | "find" | "get" | "how" | "about"
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
