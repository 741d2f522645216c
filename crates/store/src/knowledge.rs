//! Knowledge corpus and staging area.
//!
//! Live knowledge lives under `Knowledge/` as markdown files with YAML
//! frontmatter; the retriever indexes these. Staged items live under
//! `Knowledge_staging/` as JSON and are invisible to retrieval until
//! promoted by repeated re-observation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cox_domain::error::{Error, Result};
use cox_domain::node::{ContentType, MemoryNode, SourceType};

use crate::layout::Layout;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Staged knowledge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A reflector-proposed item awaiting promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedKnowledge {
    pub node: MemoryNode,
    pub content: String,
    pub staged_at: DateTime<Utc>,
    pub batch_id: String,
    pub promotion_count: u32,
    pub source_turns: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frontmatter for live knowledge files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, Deserialize)]
struct KnowledgeFront {
    id: String,
    source_type: SourceType,
    content_type: ContentType,
    initial_confidence: f64,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_id: Option<String>,
}

fn render_knowledge_file(node: &MemoryNode, content: &str) -> Result<String> {
    let front = KnowledgeFront {
        id: node.id.clone(),
        source_type: node.source_type,
        content_type: node.content_type,
        initial_confidence: node.initial_confidence,
        created_at: node.created_at,
        source_id: node.source_id.clone(),
    };
    let yaml = serde_yaml::to_string(&front)
        .map_err(|e| Error::Other(format!("knowledge frontmatter: {e}")))?;
    Ok(format!("---\n{yaml}---\n\n{content}\n"))
}

/// Parse a knowledge file back into `(node, content)`. The node's `path`
/// is filled from the caller-supplied relative path.
fn parse_knowledge_file(raw: &str, rel_path: &str) -> Option<(MemoryNode, String)> {
    let rest = raw.strip_prefix("---\n")?;
    let (yaml, body) = rest.split_once("\n---")?;
    let front: KnowledgeFront = serde_yaml::from_str(yaml).ok()?;
    let node = MemoryNode {
        id: front.id,
        path: rel_path.to_string(),
        source_type: front.source_type,
        content_type: front.content_type,
        initial_confidence: front.initial_confidence,
        created_at: front.created_at,
        validation_count: None,
        validation_success: None,
        source_id: front.source_id,
    };
    Some((node, body.trim_start_matches('\n').trim().to_string()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KnowledgeStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct KnowledgeStore {
    layout: Layout,
}

impl KnowledgeStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    // ── Live corpus ───────────────────────────────────────────────

    /// Write a live knowledge file. Returns the node with its path set.
    pub fn write_knowledge(
        &self,
        user_id: &str,
        mut node: MemoryNode,
        content: &str,
    ) -> Result<MemoryNode> {
        let dir = self.layout.knowledge_dir(user_id);
        std::fs::create_dir_all(&dir)?;
        let file_name = format!("{}.md", node.id);
        node.path = format!("Knowledge/{file_name}");
        std::fs::write(dir.join(&file_name), render_knowledge_file(&node, content)?)?;
        Ok(node)
    }

    /// All live knowledge items for a user.
    pub fn list_knowledge(&self, user_id: &str) -> Result<Vec<(MemoryNode, String)>> {
        let dir = self.layout.knowledge_dir(user_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "skipping knowledge file");
                    continue;
                }
            };
            let rel = format!(
                "Knowledge/{}",
                path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
            );
            match parse_knowledge_file(&raw, &rel) {
                Some(item) => items.push(item),
                None => {
                    tracing::warn!(path = %path.display(), "knowledge file has no valid frontmatter");
                }
            }
        }
        items.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        Ok(items)
    }

    // ── Staging ───────────────────────────────────────────────────

    pub fn stage(&self, user_id: &str, item: &StagedKnowledge) -> Result<()> {
        let dir = self.layout.staging_dir(user_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", item.node.id));
        std::fs::write(path, serde_json::to_string_pretty(item)?)?;
        Ok(())
    }

    pub fn list_staged(&self, user_id: &str) -> Result<Vec<StagedKnowledge>> {
        let dir = self.layout.staging_dir(user_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<StagedKnowledge>(&raw)?))
            {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "skipping staged item");
                }
            }
        }
        items.sort_by(|a, b| a.node.id.cmp(&b.node.id));
        Ok(items)
    }

    /// Overwrite a staged item in place (promotion counting).
    pub fn update_staged(&self, user_id: &str, item: &StagedKnowledge) -> Result<()> {
        self.stage(user_id, item)
    }

    /// Move a staged item into the live corpus and delete its staging file.
    pub fn promote(&self, user_id: &str, item: &StagedKnowledge) -> Result<MemoryNode> {
        let mut node = item.node.clone();
        // Staged paths begin with Knowledge_staging/; the promoted node's
        // path is rewritten by write_knowledge.
        node.created_at = item.staged_at;
        let node = self.write_knowledge(user_id, node, &item.content)?;
        let staged_path = self
            .layout
            .staging_dir(user_id)
            .join(format!("{}.json", item.node.id));
        std::fs::remove_file(staged_path)?;
        tracing::info!(user = user_id, id = %node.id, "staged knowledge promoted");
        Ok(node)
    }

    /// Delete staged items older than `expiry_days` whose promotion count
    /// is below `min_count`. Returns the number removed.
    pub fn expire_staged(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        expiry_days: i64,
        min_count: u32,
    ) -> Result<usize> {
        let mut removed = 0;
        for item in self.list_staged(user_id)? {
            let age_days = (now - item.staged_at).num_days();
            if age_days >= expiry_days && item.promotion_count < min_count {
                let path = self
                    .layout
                    .staging_dir(user_id)
                    .join(format!("{}.json", item.node.id));
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
