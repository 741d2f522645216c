use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Batch reflector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Batch triggers when this many turns accumulate since the last batch.
    #[serde(default = "d_turns_per_batch")]
    pub turns_per_batch: u32,
    /// ... or when accumulated urgency exceeds this.
    #[serde(default = "d_urgency_threshold")]
    pub urgency_threshold: f64,
    #[serde(default)]
    pub weights: SignalWeights,
    /// How many recent turns a batch reads.
    #[serde(default = "d_batch_window")]
    pub batch_window: usize,
    #[serde(default = "d_max_new_facts")]
    pub max_new_facts: usize,
    #[serde(default = "d_max_corrections")]
    pub max_corrections: usize,
    #[serde(default = "d_max_connections")]
    pub max_connections: usize,
    #[serde(default = "d_max_open_questions")]
    pub max_open_questions: usize,
    /// BM25 similarity against live knowledge at or above this means the
    /// item is already known and is dropped.
    #[serde(default = "d_known_ceiling")]
    pub known_similarity_ceiling: f64,
    /// BM25 similarity for counting a staged item as re-observed.
    #[serde(default = "d_promotion_similarity")]
    pub promotion_similarity: f64,
    /// Re-observations needed before a staged item goes live.
    #[serde(default = "d_promotion_count")]
    pub promotion_count: u32,
    #[serde(default = "d_staging_expiry_days")]
    pub staging_expiry_days: i64,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            turns_per_batch: d_turns_per_batch(),
            urgency_threshold: d_urgency_threshold(),
            weights: SignalWeights::default(),
            batch_window: d_batch_window(),
            max_new_facts: d_max_new_facts(),
            max_corrections: d_max_corrections(),
            max_connections: d_max_connections(),
            max_open_questions: d_max_open_questions(),
            known_similarity_ceiling: d_known_ceiling(),
            promotion_similarity: d_promotion_similarity(),
            promotion_count: d_promotion_count(),
            staging_expiry_days: d_staging_expiry_days(),
        }
    }
}

/// Urgency weights added by code-detected patterns at save time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalWeights {
    #[serde(default = "d_topic_repetition")]
    pub topic_repetition: f64,
    #[serde(default = "d_user_correction")]
    pub user_correction: f64,
    #[serde(default = "d_quality_research")]
    pub quality_research: f64,
    #[serde(default = "d_refresh_context")]
    pub refresh_context: f64,
    #[serde(default = "d_contradiction")]
    pub contradiction: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            topic_repetition: d_topic_repetition(),
            user_correction: d_user_correction(),
            quality_research: d_quality_research(),
            refresh_context: d_refresh_context(),
            contradiction: d_contradiction(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_turns_per_batch() -> u32 {
    10
}
fn d_urgency_threshold() -> f64 {
    5.0
}
fn d_batch_window() -> usize {
    10
}
fn d_max_new_facts() -> usize {
    2
}
fn d_max_corrections() -> usize {
    1
}
fn d_max_connections() -> usize {
    2
}
fn d_max_open_questions() -> usize {
    2
}
fn d_known_ceiling() -> f64 {
    0.8
}
fn d_promotion_similarity() -> f64 {
    0.7
}
fn d_promotion_count() -> u32 {
    2
}
fn d_staging_expiry_days() -> i64 {
    30
}
fn d_topic_repetition() -> f64 {
    1.0
}
fn d_user_correction() -> f64 {
    2.0
}
fn d_quality_research() -> f64 {
    1.5
}
fn d_refresh_context() -> f64 {
    1.0
}
fn d_contradiction() -> f64 {
    2.5
}
