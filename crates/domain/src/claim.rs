//! Claims — discrete factual assertions extracted from tool results.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// The assertion itself.
    pub text: String,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    /// Where the claim came from (URL or tool identifier).
    pub source: String,
    /// Seconds until the claim should be considered stale. `None` = no TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl Claim {
    /// Render as a markdown table row (`| text | conf | source | ttl |`).
    pub fn to_table_row(&self) -> String {
        let ttl = self
            .ttl_secs
            .map(|t| format!("{t}s"))
            .unwrap_or_else(|| "-".into());
        format!(
            "| {} | {:.2} | {} | {} |",
            self.text.replace('|', "\\|"),
            self.confidence,
            self.source,
            ttl
        )
    }

    /// Header rows for the claims table.
    pub fn table_header() -> &'static str {
        "| claim | confidence | source | ttl |\n|---|---|---|---|"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_row_escapes_pipes() {
        let c = Claim {
            text: "price | was $999".into(),
            confidence: 0.9,
            source: "https://vendor.example/p/1".into(),
            ttl_secs: Some(86_400),
        };
        let row = c.to_table_row();
        assert!(row.contains("price \\| was $999"));
        assert!(row.contains("86400s"));
    }

    #[test]
    fn missing_ttl_renders_dash() {
        let c = Claim {
            text: "RTX 4060 has 8GB VRAM".into(),
            confidence: 0.95,
            source: "https://vendor.example/specs".into(),
            ttl_secs: None,
        };
        assert!(c.to_table_row().ends_with("| - |"));
    }
}
