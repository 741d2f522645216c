use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retrieval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Final result count after fusion and dedup.
    #[serde(default = "d_top_k")]
    pub top_k: usize,
    /// Reciprocal-rank-fusion constant.
    #[serde(default = "d_rrf_k")]
    pub rrf_k: f64,
    /// Embedding hits below this cosine are rejected.
    #[serde(default = "d_min_cosine")]
    pub min_cosine: f32,
    /// Nodes whose decayed confidence falls below this are ineligible.
    #[serde(default = "d_confidence_floor")]
    pub confidence_floor: f64,
    #[serde(default)]
    pub decay: DecayConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: d_top_k(),
            rrf_k: d_rrf_k(),
            min_cosine: d_min_cosine(),
            confidence_floor: d_confidence_floor(),
            decay: DecayConfig::default(),
        }
    }
}

fn d_top_k() -> usize {
    15
}
fn d_rrf_k() -> f64 {
    60.0
}
fn d_min_cosine() -> f32 {
    0.40
}
fn d_confidence_floor() -> f64 {
    0.30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decay table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-content-type exponential decay parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayParams {
    /// Decay rate per day (λ).
    pub lambda_per_day: f64,
    /// Confidence never decays below this.
    pub floor: f64,
}

/// The decay table, keyed by content type string. `default` applies to any
/// content type without its own row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    #[serde(default = "default_decay_table")]
    pub table: HashMap<String, DecayParams>,
    #[serde(default = "d_default_decay")]
    pub default: DecayParams,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            table: default_decay_table(),
            default: d_default_decay(),
        }
    }
}

impl DecayConfig {
    pub fn params_for(&self, content_type: &str) -> DecayParams {
        self.table.get(content_type).copied().unwrap_or(self.default)
    }
}

fn d_default_decay() -> DecayParams {
    DecayParams {
        lambda_per_day: 0.02,
        floor: 0.30,
    }
}

fn default_decay_table() -> HashMap<String, DecayParams> {
    let rows: [(&str, f64, f64); 8] = [
        ("availability", 0.20, 0.10),
        ("price", 0.10, 0.20),
        ("product_spec", 0.03, 0.50),
        ("vendor_info", 0.02, 0.60),
        ("strategy", 0.02, 0.50),
        ("site_pattern", 0.01, 0.70),
        ("preference", 0.005, 0.80),
        ("general_fact", 0.005, 0.80),
    ];
    rows.into_iter()
        .map(|(k, lambda_per_day, floor)| {
            (
                k.to_string(),
                DecayParams {
                    lambda_per_day,
                    floor,
                },
            )
        })
        .collect()
}
