//! The per-turn document: numbered, append-only sections accumulated by the
//! pipeline stages and persisted as `context.md`.
//!
//! Invariants enforced here:
//! - no section entry is ever rewritten; retries append later attempt blocks
//! - §0 is written exactly once and is immutable for the life of the turn
//! - rendering is deterministic, so §0 bytes are identical across reads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mode / status / phase
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chat mode exposes read-only tools; code mode adds the write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Chat,
    Code,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Code => "code",
        }
    }
}

/// Terminal outcome of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Ok,
    Cancelled,
    CancelledPartial,
    Failed,
}

/// Where in the pipeline a turn currently is. Drives the cancellation
/// semantics: cancelling at or past synthesis delivers the prior synthesis,
/// at or past execution delivers a formatted partial, earlier returns
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Init,
    Analyze,
    ValidateAnalysis,
    Retrieve,
    SynthesizeContext,
    ValidateContext,
    Plan,
    Execute,
    Synthesize,
    Validate,
    Save,
}

impl TurnPhase {
    /// The pipeline stage number this phase belongs to (for cancel routing).
    pub fn stage_number(&self) -> u8 {
        match self {
            TurnPhase::Init => 0,
            TurnPhase::Analyze | TurnPhase::ValidateAnalysis => 1,
            TurnPhase::Retrieve | TurnPhase::SynthesizeContext | TurnPhase::ValidateContext => 2,
            TurnPhase::Plan => 3,
            TurnPhase::Execute => 4,
            TurnPhase::Synthesize => 6,
            TurnPhase::Validate => 7,
            TurnPhase::Save => 8,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// §0 query payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Data-requirement hints derived by query analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataRequirements {
    #[serde(default)]
    pub needs_current_prices: bool,
    #[serde(default)]
    pub needs_availability: bool,
    #[serde(default)]
    pub needs_web_research: bool,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of resolving references like "the laptop from yesterday".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceStatus {
    #[default]
    None,
    Resolved,
    Ambiguous,
}

/// The structured content of §0. Written once, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySection {
    pub raw_text: String,
    pub mode: Mode,
    pub arrived_at: DateTime<Utc>,
    #[serde(default)]
    pub user_purpose: Option<String>,
    #[serde(default)]
    pub data_requirements: DataRequirements,
    #[serde(default)]
    pub reference_status: ReferenceStatus,
    /// Turn ids explicitly referenced by the query.
    #[serde(default)]
    pub referenced_turns: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provenance block attached under a section header as fenced YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionMeta {
    pub source_type: String,
    #[serde(default)]
    pub node_ids: Vec<String>,
    pub confidence_avg: f64,
    #[serde(default)]
    pub provenance: Vec<String>,
}

/// One appended block of a numbered section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionEntry {
    pub number: u8,
    pub title: String,
    /// Attempt / iteration label (e.g. "Attempt 2", "Iteration 3").
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub meta: Option<SectionMeta>,
    pub body: String,
}

/// Canonical titles for the numbered sections.
pub fn section_title(number: u8) -> &'static str {
    match number {
        0 => "Query",
        1 => "Query Analysis Validation",
        2 => "Gathered Context",
        3 => "Strategic Plan",
        4 => "Execution Progress",
        5 => "Coordinator Narration",
        6 => "Synthesis",
        7 => "Validation",
        _ => "Appendix",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnDocument
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDocument {
    /// Directory-style id, e.g. `turn_000042`.
    pub turn_id: String,
    pub session_id: String,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
    sections: Vec<SectionEntry>,
    /// Turn-summary appendix, appended once by the save pipeline.
    appendix: Option<String>,
}

impl TurnDocument {
    pub fn new(turn_id: &str, session_id: &str, mode: Mode) -> Self {
        Self {
            turn_id: turn_id.to_string(),
            session_id: session_id.to_string(),
            mode,
            created_at: Utc::now(),
            sections: Vec::new(),
            appendix: None,
        }
    }

    /// Append a section entry, enforcing the append-only invariants.
    pub fn append(&mut self, entry: SectionEntry) -> Result<()> {
        if entry.number > 7 {
            return Err(Error::Document(format!(
                "section number {} out of range (0..=7)",
                entry.number
            )));
        }
        if entry.number == 0 && self.has_section(0) {
            return Err(Error::Document("section 0 is immutable".into()));
        }
        let duplicate = self
            .sections
            .iter()
            .any(|s| s.number == entry.number && s.label == entry.label);
        if duplicate {
            return Err(Error::Document(format!(
                "section {} ({:?}) already written; append a new attempt block instead",
                entry.number, entry.label
            )));
        }
        self.sections.push(entry);
        Ok(())
    }

    /// Convenience: append with the canonical title and no meta.
    pub fn append_simple(&mut self, number: u8, label: Option<String>, body: String) -> Result<()> {
        self.append(SectionEntry {
            number,
            title: section_title(number).to_string(),
            label,
            meta: None,
            body,
        })
    }

    pub fn has_section(&self, number: u8) -> bool {
        self.sections.iter().any(|s| s.number == number)
    }

    /// All entries for a section, in append order.
    pub fn entries(&self, number: u8) -> Vec<&SectionEntry> {
        self.sections.iter().filter(|s| s.number == number).collect()
    }

    /// The most recently appended entry of a section.
    pub fn latest(&self, number: u8) -> Option<&SectionEntry> {
        self.sections.iter().rev().find(|s| s.number == number)
    }

    /// Number of entries already written for a section (next attempt index).
    pub fn entry_count(&self, number: u8) -> usize {
        self.sections.iter().filter(|s| s.number == number).count()
    }

    pub fn all_entries(&self) -> &[SectionEntry] {
        &self.sections
    }

    /// Set the turn-summary appendix (once).
    pub fn set_appendix(&mut self, summary: String) -> Result<()> {
        if self.appendix.is_some() {
            return Err(Error::Document("turn-summary appendix already set".into()));
        }
        self.appendix = Some(summary);
        Ok(())
    }

    pub fn appendix(&self) -> Option<&str> {
        self.appendix.as_deref()
    }

    /// Whether a factual claim is supported by gathered context (§2) or
    /// execution progress (§4) — a string-containment check over both.
    pub fn supports_claim(&self, needle: &str) -> bool {
        self.sections
            .iter()
            .filter(|s| s.number == 2 || s.number == 4)
            .any(|s| s.body.contains(needle))
    }

    /// Render the whole document as markdown. Deterministic: the same
    /// document always renders to the same bytes.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# Turn {} — session {} ({})\n",
            self.turn_id,
            self.session_id,
            self.mode.as_str()
        ));
        for entry in &self.sections {
            out.push('\n');
            out.push_str(&format!("## {}. {}\n", entry.number, entry.title));
            if let Some(label) = &entry.label {
                out.push_str(&format!("### {label}\n"));
            }
            if let Some(meta) = &entry.meta {
                let yaml = serde_yaml::to_string(meta).unwrap_or_default();
                out.push_str("```yaml\n");
                out.push_str(&yaml);
                out.push_str("```\n");
            }
            out.push('\n');
            out.push_str(entry.body.trim_end());
            out.push('\n');
        }
        if let Some(appendix) = &self.appendix {
            out.push_str("\n## Turn Summary\n\n");
            out.push_str(appendix.trim_end());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> TurnDocument {
        TurnDocument::new("turn_000001", "s1", Mode::Chat)
    }

    fn entry(number: u8, label: Option<&str>, body: &str) -> SectionEntry {
        SectionEntry {
            number,
            title: section_title(number).to_string(),
            label: label.map(String::from),
            meta: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn sections_append_in_order() {
        let mut d = doc();
        d.append(entry(0, None, "hello")).unwrap();
        d.append(entry(1, None, "pass")).unwrap();
        d.append(entry(2, None, "(no context)")).unwrap();
        let numbers: Vec<u8> = d.all_entries().iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn section_zero_is_immutable() {
        let mut d = doc();
        d.append(entry(0, None, "hello")).unwrap();
        let err = d.append(entry(0, Some("Attempt 2"), "bye")).unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn duplicate_label_rejected_new_attempt_allowed() {
        let mut d = doc();
        d.append(entry(7, Some("Attempt 1"), "RETRY")).unwrap();
        assert!(d.append(entry(7, Some("Attempt 1"), "again")).is_err());
        d.append(entry(7, Some("Attempt 2"), "APPROVE")).unwrap();
        assert_eq!(d.entry_count(7), 2);
    }

    #[test]
    fn execution_blocks_accumulate() {
        let mut d = doc();
        for i in 1..=3 {
            d.append(entry(4, Some(&format!("Attempt 1 — Iteration {i}")), "ran tool"))
                .unwrap();
        }
        assert_eq!(d.entries(4).len(), 3);
        assert_eq!(
            d.latest(4).unwrap().label.as_deref(),
            Some("Attempt 1 — Iteration 3")
        );
    }

    #[test]
    fn out_of_range_section_rejected() {
        let mut d = doc();
        assert!(d.append(entry(8, None, "nope")).is_err());
    }

    #[test]
    fn render_is_deterministic_and_ordered() {
        let mut d = doc();
        d.append(entry(0, None, "what's my favorite hamster?")).unwrap();
        d.append(entry(1, None, "pass")).unwrap();
        let first = d.render();
        let second = d.render();
        assert_eq!(first, second);
        let q = first.find("## 0. Query").unwrap();
        let v = first.find("## 1. Query Analysis Validation").unwrap();
        assert!(q < v);
    }

    #[test]
    fn render_includes_meta_fence() {
        let mut d = doc();
        d.append(SectionEntry {
            number: 2,
            title: section_title(2).to_string(),
            label: None,
            meta: Some(SectionMeta {
                source_type: "preference".into(),
                node_ids: vec!["n_1".into()],
                confidence_avg: 0.91,
                provenance: vec!["users/s1/preferences.md".into()],
            }),
            body: "Prefers Syrian hamsters.".into(),
        })
        .unwrap();
        let md = d.render();
        assert!(md.contains("```yaml\n"));
        assert!(md.contains("source_type: preference"));
        assert!(md.contains("confidence_avg: 0.91"));
    }

    #[test]
    fn appendix_set_once() {
        let mut d = doc();
        d.set_appendix("User asked about hamsters.".into()).unwrap();
        assert!(d.set_appendix("again".into()).is_err());
        assert!(d.render().contains("## Turn Summary"));
    }

    #[test]
    fn supports_claim_searches_context_and_execution() {
        let mut d = doc();
        d.append(entry(2, None, "cached: https://vendor.example/p/9 at $899"))
            .unwrap();
        d.append(entry(4, Some("Iteration 1"), "fetched https://shop.example/x"))
            .unwrap();
        assert!(d.supports_claim("https://vendor.example/p/9"));
        assert!(d.supports_claim("https://shop.example/x"));
        assert!(!d.supports_claim("https://elsewhere.example"));
    }

    #[test]
    fn phase_stage_numbers() {
        assert_eq!(TurnPhase::Init.stage_number(), 0);
        assert_eq!(TurnPhase::ValidateAnalysis.stage_number(), 1);
        assert_eq!(TurnPhase::ValidateContext.stage_number(), 2);
        assert_eq!(TurnPhase::Execute.stage_number(), 4);
        assert_eq!(TurnPhase::Synthesize.stage_number(), 6);
        assert_eq!(TurnPhase::Validate.stage_number(), 7);
    }
}
