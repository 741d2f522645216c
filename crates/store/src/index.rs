//! Append-mostly JSONL indexes: turn index, research index, and the
//! calibration log.
//!
//! Single-writer-per-file semantics via an advisory lock held only for the
//! duration of the append; readers go through a cache invalidated on write.
//! Bad lines are skipped with a warning rather than poisoning the index.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use cox_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generic JSONL file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct JsonlFile<T> {
    path: PathBuf,
    cache: RwLock<Option<Vec<T>>>,
}

impl<T: Serialize + DeserializeOwned + Clone> JsonlFile<T> {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    fn append(&self, entry: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let line = serde_json::to_string(entry)?;
        let write_result = writeln!(file, "{line}");
        let _ = fs2::FileExt::unlock(&file);
        write_result?;

        // Invalidate the read cache.
        *self.cache.write() = None;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<T>> {
        if let Some(cached) = self.cache.read().as_ref() {
            return Ok(cached.clone());
        }
        let entries = if self.path.exists() {
            let raw = std::fs::read_to_string(&self.path)?;
            raw.lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| match serde_json::from_str::<T>(l) {
                    Ok(e) => Some(e),
                    Err(e) => {
                        tracing::warn!(error = %e, path = %self.path.display(), "skipping bad index line");
                        None
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        *self.cache.write() = Some(entries.clone());
        Ok(entries)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnIndexEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub quality_score: f64,
    /// Path to the turn directory, relative to the storage root.
    pub turn_dir: String,
}

pub struct TurnIndex {
    file: JsonlFile<TurnIndexEntry>,
}

impl TurnIndex {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: JsonlFile::new(path),
        }
    }

    pub fn append(&self, entry: &TurnIndexEntry) -> Result<()> {
        self.file.append(entry)
    }

    /// Entries for a session, newest first.
    pub fn for_session(&self, session_id: &str) -> Result<Vec<TurnIndexEntry>> {
        let mut entries: Vec<_> = self
            .file
            .read_all()?
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.file.read_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Research index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchIndexEntry {
    pub primary_topic: String,
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub content_type: String,
    pub turn_dir: String,
}

pub struct ResearchIndex {
    file: JsonlFile<ResearchIndexEntry>,
}

impl ResearchIndex {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: JsonlFile::new(path),
        }
    }

    pub fn append(&self, entry: &ResearchIndexEntry) -> Result<()> {
        self.file.append(entry)
    }

    /// Unexpired entries whose topic contains the query, best quality first.
    pub fn lookup(&self, topic: &str, now: DateTime<Utc>) -> Result<Vec<ResearchIndexEntry>> {
        let needle = topic.to_lowercase();
        let mut entries: Vec<_> = self
            .file
            .read_all()?
            .into_iter()
            .filter(|e| e.expires_at > now)
            .filter(|e| e.primary_topic.to_lowercase().contains(&needle))
            .collect();
        entries.sort_by(|a, b| {
            b.quality_score
                .partial_cmp(&a.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(entries)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Calibration log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Predicted-vs-observed confidence records for offline calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationEntry {
    pub node_id: String,
    pub predicted: f64,
    pub observed: f64,
    pub recorded_at: DateTime<Utc>,
}

pub struct CalibrationLog {
    file: JsonlFile<CalibrationEntry>,
}

impl CalibrationLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: JsonlFile::new(path),
        }
    }

    pub fn record(&self, node_id: &str, predicted: f64, observed: f64) -> Result<()> {
        self.file.append(&CalibrationEntry {
            node_id: node_id.to_string(),
            predicted,
            observed,
            recorded_at: Utc::now(),
        })
    }

    pub fn read_all(&self) -> Result<Vec<CalibrationEntry>> {
        self.file.read_all()
    }
}
