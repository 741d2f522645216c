//! Memory nodes — the stored artifacts the retriever searches over.
//!
//! A node's confidence is never stored post-decay; `current_confidence` is
//! derived at read time from the content type's decay parameters (see
//! `cox-memory`). The bands below are the universal thresholds every
//! consumer uses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source / content types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    TurnSummary,
    Preference,
    Fact,
    ResearchCache,
    VisitRecord,
    UserQuery,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::TurnSummary => "turn_summary",
            SourceType::Preference => "preference",
            SourceType::Fact => "fact",
            SourceType::ResearchCache => "research_cache",
            SourceType::VisitRecord => "visit_record",
            SourceType::UserQuery => "user_query",
        }
    }
}

/// Content classification; selects the decay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Availability,
    Price,
    ProductSpec,
    VendorInfo,
    Strategy,
    SitePattern,
    Preference,
    GeneralFact,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Availability => "availability",
            ContentType::Price => "price",
            ContentType::ProductSpec => "product_spec",
            ContentType::VendorInfo => "vendor_info",
            ContentType::Strategy => "strategy",
            ContentType::SitePattern => "site_pattern",
            ContentType::Preference => "preference",
            ContentType::GeneralFact => "general_fact",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MemoryNode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    /// Stable identifier.
    pub id: String,
    /// Document path relative to the user root.
    pub path: String,
    pub source_type: SourceType,
    pub content_type: ContentType,
    /// Confidence assigned at creation, in [0, 1].
    pub initial_confidence: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_success: Option<u32>,
    /// Producing turn or tool invocation, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Confidence bands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Universal confidence thresholds used by every consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// ≥ 0.80 — state as fact / APPROVE.
    High,
    /// 0.50 – 0.79 — hedge / REVISE.
    Medium,
    /// 0.30 – 0.49 — caveat / RETRY.
    Low,
    /// < 0.30 — excluded from retrieval.
    Expired,
}

impl ConfidenceBand {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.80 {
            ConfidenceBand::High
        } else if score >= 0.50 {
            ConfidenceBand::Medium
        } else if score >= 0.30 {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::Expired
        }
    }

    pub fn is_includable(&self) -> bool {
        !matches!(self, ConfidenceBand::Expired)
    }
}
