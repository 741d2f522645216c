//! Reader for persisted `context.md` documents.
//!
//! The writer side is `TurnDocument::render` in `cox-domain`; this module
//! parses the rendered form back into numbered sections. Fences are treated
//! literally: a `## ` line inside a code fence never starts a section.

use cox_domain::turn::SectionMeta;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsed types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ParsedSection {
    pub number: u8,
    pub title: String,
    pub label: Option<String>,
    pub meta: Option<SectionMeta>,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub sections: Vec<ParsedSection>,
    /// The turn-summary appendix, when present.
    pub appendix: Option<String>,
}

impl ParsedDocument {
    pub fn latest(&self, number: u8) -> Option<&ParsedSection> {
        self.sections.iter().rev().find(|s| s.number == number)
    }

    pub fn entries(&self, number: u8) -> Vec<&ParsedSection> {
        self.sections.iter().filter(|s| s.number == number).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse a rendered `context.md` into its numbered sections and appendix.
pub fn parse_sections(markdown: &str) -> ParsedDocument {
    let mut doc = ParsedDocument::default();

    // Split into header-delimited chunks, respecting fences.
    let mut current: Option<(String, Vec<String>)> = None; // (header line, body lines)
    let mut in_fence = false;
    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && line.starts_with("## ") {
            if let Some((header, lines)) = current.take() {
                push_chunk(&mut doc, &header, lines);
            }
            current = Some((line["## ".len()..].to_string(), Vec::new()));
            continue;
        }
        if let Some((_, lines)) = current.as_mut() {
            lines.push(line.to_string());
        }
    }
    if let Some((header, lines)) = current.take() {
        push_chunk(&mut doc, &header, lines);
    }

    doc
}

fn push_chunk(doc: &mut ParsedDocument, header: &str, lines: Vec<String>) {
    if header.trim() == "Turn Summary" {
        doc.appendix = Some(lines.join("\n").trim().to_string());
        return;
    }

    // Header form: "N. Title".
    let Some((num_str, title)) = header.split_once(". ") else {
        return;
    };
    let Ok(number) = num_str.trim().parse::<u8>() else {
        return;
    };

    let mut label = None;
    let mut meta = None;
    let mut body_lines: Vec<&str> = Vec::new();
    let mut idx = 0;

    // Optional "### label" line directly under the header.
    while idx < lines.len() && lines[idx].trim().is_empty() {
        idx += 1;
    }
    if idx < lines.len() {
        if let Some(rest) = lines[idx].strip_prefix("### ") {
            label = Some(rest.trim().to_string());
            idx += 1;
        }
    }
    while idx < lines.len() && lines[idx].trim().is_empty() {
        idx += 1;
    }

    // Optional fenced `_meta` YAML block.
    if idx < lines.len() && lines[idx].trim_start().starts_with("```yaml") {
        let mut yaml_lines = Vec::new();
        idx += 1;
        while idx < lines.len() && !lines[idx].trim_start().starts_with("```") {
            yaml_lines.push(lines[idx].as_str());
            idx += 1;
        }
        idx += 1; // closing fence
        match serde_yaml::from_str::<SectionMeta>(&yaml_lines.join("\n")) {
            Ok(m) => meta = Some(m),
            Err(e) => {
                tracing::warn!(error = %e, section = number, "unparseable _meta block; kept as body");
                body_lines.push("```yaml");
                body_lines.extend(yaml_lines);
                body_lines.push("```");
            }
        }
    }

    for line in &lines[idx.min(lines.len())..] {
        body_lines.push(line.as_str());
    }

    doc.sections.push(ParsedSection {
        number,
        title: title.trim().to_string(),
        label,
        meta,
        body: body_lines.join("\n").trim().to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use cox_domain::turn::{section_title, Mode, SectionEntry, TurnDocument};

    fn rendered_doc() -> String {
        let mut d = TurnDocument::new("turn_000003", "s1", Mode::Chat);
        d.append_simple(0, None, "find me a laptop".into()).unwrap();
        d.append(SectionEntry {
            number: 2,
            title: section_title(2).to_string(),
            label: None,
            meta: Some(SectionMeta {
                source_type: "research_cache".into(),
                node_ids: vec!["n_9".into()],
                confidence_avg: 0.77,
                provenance: vec!["users/s1/turns/turn_000002/context.md".into()],
            }),
            body: "Cached research: https://vendor.example/p/1".into(),
        })
        .unwrap();
        d.append_simple(4, Some("Attempt 1 — Iteration 1".into()), "ran internet.research".into())
            .unwrap();
        d.append_simple(4, Some("Attempt 1 — Iteration 2".into()), "analyzed results".into())
            .unwrap();
        d.set_appendix("User wants a budget laptop.".into()).unwrap();
        d.render()
    }

    #[test]
    fn round_trips_sections_from_render() {
        let parsed = parse_sections(&rendered_doc());
        assert_eq!(parsed.sections.len(), 4);
        assert_eq!(parsed.sections[0].number, 0);
        assert_eq!(parsed.sections[0].body, "find me a laptop");
        assert_eq!(parsed.appendix.as_deref(), Some("User wants a budget laptop."));
    }

    #[test]
    fn meta_block_round_trips() {
        let parsed = parse_sections(&rendered_doc());
        let ctx = parsed.latest(2).unwrap();
        let meta = ctx.meta.as_ref().unwrap();
        assert_eq!(meta.source_type, "research_cache");
        assert_eq!(meta.confidence_avg, 0.77);
        assert_eq!(meta.node_ids, vec!["n_9"]);
        assert!(ctx.body.contains("https://vendor.example/p/1"));
    }

    #[test]
    fn labels_round_trip() {
        let parsed = parse_sections(&rendered_doc());
        let blocks = parsed.entries(4);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].label.as_deref(), Some("Attempt 1 — Iteration 1"));
        assert_eq!(blocks[1].label.as_deref(), Some("Attempt 1 — Iteration 2"));
    }

    #[test]
    fn header_inside_fence_does_not_split() {
        let md = "## 0. Query\n\nbody\n\n## 6. Synthesis\n\n```\n## 3. Not a header\n```\nafter fence\n";
        let parsed = parse_sections(md);
        assert_eq!(parsed.sections.len(), 2);
        let synth = parsed.latest(6).unwrap();
        assert!(synth.body.contains("## 3. Not a header"));
        assert!(synth.body.contains("after fence"));
    }

    #[test]
    fn empty_document_parses_empty() {
        let parsed = parse_sections("");
        assert!(parsed.sections.is_empty());
        assert!(parsed.appendix.is_none());
    }
}
