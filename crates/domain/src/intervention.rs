//! Interventions — user messages that arrive while a turn is active.
//!
//! Classification happens on receipt, not at poll time: a phrase match
//! decides cancel, the `skip X` / `focus on X` / `also check X` forms decide
//! guide, and everything else is stored as a redirect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kinds & classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const CANCEL_PHRASES: &[&str] = &["cancel", "stop", "nevermind", "never mind", "abort", "forget it"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    Cancel,
    Guide,
    Redirect,
}

/// Classify an incoming mid-turn message.
pub fn classify(text: &str) -> InterventionKind {
    let lowered = text.trim().to_lowercase();
    let stripped = lowered.trim_end_matches(['.', '!']);
    if CANCEL_PHRASES.contains(&stripped) {
        return InterventionKind::Cancel;
    }
    if parse_guidance(&lowered).is_some() {
        return InterventionKind::Guide;
    }
    InterventionKind::Redirect
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guidance adjustments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structured adjustment parsed from a guide-form message. Messages that
/// match no form are carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuidanceAdjustment {
    SkipVendor { target: String },
    FocusQuery { target: String },
    AddVendor { target: String },
    Guidance { text: String },
}

/// Parse the recognized guide forms: `skip X`, `focus on X`, `also check X`.
pub fn parse_guidance(text: &str) -> Option<GuidanceAdjustment> {
    let lowered = text.trim().to_lowercase();
    if let Some(rest) = lowered.strip_prefix("skip ") {
        return Some(GuidanceAdjustment::SkipVendor {
            target: rest.trim().to_string(),
        });
    }
    if let Some(rest) = lowered.strip_prefix("focus on ") {
        return Some(GuidanceAdjustment::FocusQuery {
            target: rest.trim().to_string(),
        });
    }
    if let Some(rest) = lowered.strip_prefix("also check ") {
        return Some(GuidanceAdjustment::AddVendor {
            target: rest.trim().to_string(),
        });
    }
    None
}

/// Convert any mid-turn message into its structured adjustment, falling back
/// to opaque guidance text.
pub fn to_adjustment(text: &str) -> GuidanceAdjustment {
    parse_guidance(text).unwrap_or(GuidanceAdjustment::Guidance {
        text: text.to_string(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Intervention record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: Uuid,
    pub session_id: String,
    pub turn_id: String,
    pub kind: InterventionKind,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub consumed: bool,
}

impl Intervention {
    pub fn new(session_id: &str, turn_id: &str, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            turn_id: turn_id.to_string(),
            kind: classify(text),
            text: text.to_string(),
            received_at: Utc::now(),
            consumed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_phrases_classify_as_cancel() {
        for phrase in ["cancel", "STOP", "Never mind", "abort", "forget it", "nevermind."] {
            assert_eq!(classify(phrase), InterventionKind::Cancel, "phrase: {phrase}");
        }
    }

    #[test]
    fn guide_forms_classify_as_guide() {
        assert_eq!(classify("skip bestbuy"), InterventionKind::Guide);
        assert_eq!(classify("focus on refurbished"), InterventionKind::Guide);
        assert_eq!(classify("also check newegg"), InterventionKind::Guide);
    }

    #[test]
    fn everything_else_is_redirect() {
        assert_eq!(
            classify("actually make it a desktop instead"),
            InterventionKind::Redirect
        );
    }

    #[test]
    fn cancel_requires_whole_phrase() {
        // "stop" embedded in a longer request is not a cancel.
        assert_ne!(classify("stop at three results"), InterventionKind::Cancel);
    }

    #[test]
    fn guidance_parses_targets() {
        assert_eq!(
            parse_guidance("skip bestbuy"),
            Some(GuidanceAdjustment::SkipVendor {
                target: "bestbuy".into()
            })
        );
        assert_eq!(
            parse_guidance("focus on gaming laptops"),
            Some(GuidanceAdjustment::FocusQuery {
                target: "gaming laptops".into()
            })
        );
        assert_eq!(
            parse_guidance("also check microcenter"),
            Some(GuidanceAdjustment::AddVendor {
                target: "microcenter".into()
            })
        );
        assert_eq!(parse_guidance("look harder"), None);
    }

    #[test]
    fn opaque_fallback_preserves_text() {
        match to_adjustment("prefer official vendor sites") {
            GuidanceAdjustment::Guidance { text } => {
                assert_eq!(text, "prefer official vendor sites");
            }
            other => panic!("expected opaque guidance, got {other:?}"),
        }
    }

    #[test]
    fn new_intervention_is_unconsumed() {
        let i = Intervention::new("s1", "turn_000001", "skip amazon");
        assert_eq!(i.kind, InterventionKind::Guide);
        assert!(!i.consumed);
        assert_eq!(i.session_id, "s1");
    }
}
